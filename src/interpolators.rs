//! A module containing the interpolation kernels used by the fractional sample reader:
//! linear, four-point cubic and windowed sinc.

use std::f32::consts::PI;

/// Linearly interpolates between `a` and `b` by parameter `t`
pub fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a * (1.0 - t) + b * t
}

/// Sinc function defined as sin (pi x) / (pi x)
/// Defined as 1 at x = 0 (division by zero otherwise)
pub fn sinc(x: f32) -> f32 {
    if x == 0.0 {
        1.0
    } else {
        let px = PI * x;
        px.sin() / px
    }
}

/// Three-term Blackman window evaluated at tap offset `i` for a kernel of
/// half-width `n` taps. `i` ranges over -n ..= n; the window is 1 at the centre
/// tap and falls to 0 at the outermost taps.
pub fn blackman_window(i: f32, n: f32) -> f32 {
    0.42 + 0.5 * (PI * i / n).cos() + 0.08 * (2.0 * PI * i / n).cos()
}

/// Four-point cubic interpolation through y0..y3 with interpolant `t` between
/// y1 and y2. Catmull-style coefficients, expanded so the whole evaluation is
/// four multiplies and a handful of adds.
pub fn cubic_interpolate(y0: f32, y1: f32, y2: f32, y3: f32, t: f32) -> f32 {
    let a0 = y3 - y2 - y0 + y1;
    let a1 = y0 - y1 - a0;
    let a2 = y2 - y0;
    let a3 = y1;

    a0 * t * t * t + a1 * t * t + a2 * t + a3
}
