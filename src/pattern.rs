use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::f64::consts::TAU;
use std::fmt::Write;

pub const PARTICLE_COUNT: usize = 200;
const RADIUS_MEAN: f64 = 8.0;
const RADIUS_STDDEV: f64 = 2.0;
const HUE_STEP: f64 = 22.5;
const ANGLE_STEP: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Particle {
    /// Centre in the 0..100 view box.
    pub x: f64,
    pub y: f64,
    pub radius: f64,
    pub opacity: f64,
    pub hue: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pattern {
    pub hue_start: f64,
    pub hue_end: f64,
    /// Gradient rotation in degrees.
    pub angle: f64,
    pub particles: Vec<Particle>,
}

/// Hex SHA-256 digests of the text as typed, reversed, upper-case, lower-case
/// and with its characters sorted, concatenated.
pub fn entropy_pool(opinion: &str) -> String {
    let reversed: String = opinion.chars().rev().collect();
    let mut chars: Vec<char> = opinion.chars().collect();
    chars.sort_unstable();
    let sorted: String = chars.into_iter().collect();

    let variants = [
        opinion.to_string(),
        reversed,
        opinion.to_uppercase(),
        opinion.to_lowercase(),
        sorted,
    ];
    let mut pool = String::with_capacity(variants.len() * 64);
    for variant in &variants {
        push_hex_digest(&mut pool, variant.as_bytes());
    }
    pool
}

fn push_hex_digest(out: &mut String, bytes: &[u8]) {
    for byte in Sha256::digest(bytes) {
        let _ = write!(out, "{byte:02x}");
    }
}

fn hex_value(digit: u8) -> u8 {
    (digit as char).to_digit(16).unwrap_or(0) as u8
}

/// Reads successive two-digit windows, stretching the pool by re-hashing it when it runs out.
struct HexWindows {
    pool: String,
    pos: usize,
}

impl HexWindows {
    fn new(pool: String, start: usize) -> Self {
        Self { pool, pos: start }
    }

    fn next_byte(&mut self) -> u8 {
        if self.pos + 2 > self.pool.len() {
            let digest_input = self.pool.clone();
            push_hex_digest(&mut self.pool, digest_input.as_bytes());
        }
        let bytes = self.pool.as_bytes();
        let value = hex_value(bytes[self.pos]) << 4 | hex_value(bytes[self.pos + 1]);
        self.pos += 2;
        value
    }

    fn unit(&mut self) -> f64 {
        f64::from(self.next_byte()) / 255.0
    }

    /// Box-Muller over two bytes; `u1` stays strictly inside (0, 1).
    fn gaussian(&mut self, mean: f64, stddev: f64) -> f64 {
        let u1 = (f64::from(self.next_byte()) + 1.0) / 257.0;
        let u2 = f64::from(self.next_byte()) / 256.0;
        let z = (-2.0 * u1.ln()).sqrt() * (TAU * u2).cos();
        mean + stddev * z
    }
}

impl Pattern {
    pub fn generate(opinion: &str) -> Self {
        let pool = entropy_pool(opinion);
        let head = pool.as_bytes();
        let hue_start = (f64::from(hex_value(head[0])) * HUE_STEP) % 360.0;
        let hue_end = (f64::from(hex_value(head[1])) * HUE_STEP) % 360.0;
        let angle = (f64::from(hex_value(head[2])) * ANGLE_STEP) % 360.0;

        let mut windows = HexWindows::new(pool, 3);
        let mut particles = Vec::with_capacity(PARTICLE_COUNT);
        for _ in 0..PARTICLE_COUNT {
            let x = windows.unit() * 100.0;
            let y = windows.unit() * 100.0;
            let radius = windows.gaussian(RADIUS_MEAN, RADIUS_STDDEV);
            let opacity = 0.15 + 0.55 * windows.unit();
            let hue = windows.unit() * 360.0;
            if radius <= 0.0 {
                continue;
            }
            particles.push(Particle {
                x,
                y,
                radius,
                opacity,
                hue,
            });
        }

        Self {
            hue_start,
            hue_end,
            angle,
            particles,
        }
    }

    pub fn to_svg(&self) -> String {
        let mut svg = String::with_capacity(512 + self.particles.len() * 96);
        let _ = write!(
            svg,
            "<svg xmlns='http://www.w3.org/2000/svg' viewBox='0 0 100 100' preserveAspectRatio='xMidYMid slice'>\
             <defs><linearGradient id='g' gradientTransform='rotate({angle} 0.5 0.5)'>\
             <stop offset='0' stop-color='hsl({start},70%,60%)'/>\
             <stop offset='1' stop-color='hsl({end},70%,60%)'/>\
             </linearGradient></defs><rect width='100' height='100' fill='url(#g)'/>",
            angle = self.angle,
            start = self.hue_start,
            end = self.hue_end,
        );
        for p in &self.particles {
            let _ = write!(
                svg,
                "<circle cx='{:.2}' cy='{:.2}' r='{:.2}' fill='hsl({:.0},80%,70%)' fill-opacity='{:.2}'/>",
                p.x, p.y, p.radius, p.hue, p.opacity
            );
        }
        svg.push_str("</svg>");
        svg
    }

    /// Value for a CSS `background-image` property.
    pub fn css_background(&self) -> String {
        format!(
            "url(\"data:image/svg+xml,{}\")",
            utf8_percent_encode(&self.to_svg(), NON_ALPHANUMERIC)
        )
    }
}

/// HSL (degrees, 0..1, 0..1) to 8-bit RGB.
pub fn hsl_to_rgb(hue: f64, saturation: f64, lightness: f64) -> [u8; 3] {
    let c = (1.0 - (2.0 * lightness - 1.0).abs()) * saturation;
    let h = hue.rem_euclid(360.0) / 60.0;
    let x = c * (1.0 - (h % 2.0 - 1.0).abs());
    let (r, g, b) = match h as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    let m = lightness - c / 2.0;
    let channel = |v: f64| ((v + m) * 255.0).round().clamp(0.0, 255.0) as u8;
    [channel(r), channel(g), channel(b)]
}
