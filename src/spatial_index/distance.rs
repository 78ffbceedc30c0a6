//! Great-circle distance between two coordinates given in degrees.

/// Mean radius of the earth in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine distance in meters between `(lat1, lon1)` and `(lat2, lon2)`.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();

    let rlat1 = lat1.to_radians();
    let rlat2 = lat2.to_radians();

    let sq = |x: f64| x * x;

    // Rounding can push h marginally outside [0, 1] for antipodal points.
    let h = (sq((dlat / 2.0).sin()) + rlat1.cos() * rlat2.cos() * sq((dlon / 2.0).sin()))
        .clamp(0.0, 1.0);

    2.0 * EARTH_RADIUS_M * h.sqrt().atan2((1.0 - h).sqrt())
}
