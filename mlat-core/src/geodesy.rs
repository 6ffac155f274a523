//! WGS84 geodesy: LLH <-> ECEF conversion and Euclidean distance.

/// WGS84 semi-major axis, metres.
pub const WGS84_A: f64 = 6_378_137.0;

/// WGS84 flattening.
pub const WGS84_F: f64 = 1.0 / 298.257223563;

fn eccentricity_squared() -> f64 {
    WGS84_F * (2.0 - WGS84_F)
}

/// A 3-D Cartesian point, used both for ECEF position and plain vectors.
pub type Ecef = (f64, f64, f64);

/// Latitude (deg), longitude (deg), height above ellipsoid (m).
pub type Llh = (f64, f64, f64);

/// Convert geodetic LLH to ECEF.
pub fn llh2ecef(llh: Llh) -> Ecef {
    let (lat, lon, alt) = llh;
    let lat_r = lat.to_radians();
    let lon_r = lon.to_radians();
    let e2 = eccentricity_squared();

    let sin_lat = lat_r.sin();
    let cos_lat = lat_r.cos();
    let n = WGS84_A / (1.0 - e2 * sin_lat * sin_lat).sqrt();

    let x = (n + alt) * cos_lat * lon_r.cos();
    let y = (n + alt) * cos_lat * lon_r.sin();
    let z = (n * (1.0 - e2) + alt) * sin_lat;

    (x, y, z)
}

/// Convert ECEF to geodetic LLH via Bowring's iterative method.
pub fn ecef2llh(ecef: Ecef) -> Llh {
    let (x, y, z) = ecef;
    let e2 = eccentricity_squared();
    let p = (x * x + y * y).sqrt();

    let lon = y.atan2(x);

    // Initial guess assumes alt = 0.
    let mut lat = z.atan2(p * (1.0 - e2));
    let mut alt = 0.0;

    for _ in 0..10 {
        let sin_lat = lat.sin();
        let n = WGS84_A / (1.0 - e2 * sin_lat * sin_lat).sqrt();
        alt = p / lat.cos() - n;
        let new_lat = z.atan2(p * (1.0 - e2 * n / (n + alt)));
        if (new_lat - lat).abs() < 1e-12 {
            lat = new_lat;
            break;
        }
        lat = new_lat;
    }

    (lat.to_degrees(), lon.to_degrees(), alt)
}

/// Euclidean distance between two ECEF points, metres.
pub fn ecef_distance(a: Ecef, b: Ecef) -> f64 {
    let dx = a.0 - b.0;
    let dy = a.1 - b.1;
    let dz = a.2 - b.2;
    (dx * dx + dy * dy + dz * dz).sqrt()
}
