/// Distance returned when the radio reported no usable signal strength.
pub const UNKNOWN_DISTANCE: f64 = -1.0;

/// Empirical RSSI to distance curve, in meters rounded to centimeters.
///
/// The two branches meet at `ratio == 1.0` without being continuous there.
pub fn estimate(rssi: i32, reference_power: Option<i32>, default_power: i32) -> f64 {
    if rssi == 0 {
        return UNKNOWN_DISTANCE;
    }

    let mut power = match reference_power {
        Some(p) if p != 0 => p,
        _ => default_power,
    };
    if power > 0 {
        power = -power;
    }

    let ratio = rssi as f64 / power as f64;
    let distance = if ratio < 1.0 {
        ratio.powi(10)
    } else {
        0.89976 * ratio.powf(7.7095) + 0.111
    };

    (distance * 100.0).round() / 100.0
}
