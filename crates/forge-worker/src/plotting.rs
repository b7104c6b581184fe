//! A minimal matplotlib-equivalent figure capture shim.
//!
//! `rustpython-stdlib` carries no real plotting library, so this module
//! provides its own tiny canvas: cells draw lines, points, and bars onto an
//! RGB raster through the `forge_plot` Python-level shim (installed in
//! `interpreter::BOOTSTRAP`), and any figures still open when the cell
//! returns are PNG-encoded and base64ed into a `display_data` payload, then
//! the open-figure list is cleared.
//!
//! The PNG encoder below is hand-rolled rather than pulled from a crate:
//! nothing in this dependency stack brings one in, and a valid PNG only
//! requires a zlib stream, which the DEFLATE format permits to be built
//! entirely from uncompressed ("stored") blocks — no compression algorithm
//! required, just chunk framing and two checksums.

use std::collections::HashMap;
use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;

const CANVAS_WIDTH: usize = 480;
const CANVAS_HEIGHT: usize = 320;
const MARGIN: f64 = 24.0;

const BACKGROUND: [u8; 3] = [255, 255, 255];
const AXIS_COLOR: [u8; 3] = [60, 60, 60];
const LINE_COLOR: [u8; 3] = [31, 87, 163];
const POINT_COLOR: [u8; 3] = [191, 59, 59];
const BAR_COLOR: [u8; 3] = [70, 130, 180];

struct Figure {
    canvas: Vec<u8>,
    title: Option<String>,
}

impl Figure {
    fn blank() -> Self {
        let mut canvas = vec![0u8; CANVAS_WIDTH * CANVAS_HEIGHT * 3];
        for px in canvas.chunks_exact_mut(3) {
            px.copy_from_slice(&BACKGROUND);
        }
        draw_rect_outline(&mut canvas, 0, 0, CANVAS_WIDTH - 1, CANVAS_HEIGHT - 1, AXIS_COLOR);
        Self { canvas, title: None }
    }
}

static FIGURES: Mutex<Vec<Figure>> = Mutex::new(Vec::new());

/// `FIGURES` is process-global, so any test anywhere in this crate that
/// exercises plotting (directly or through a cell running `forge_plot.*`)
/// must hold this lock for the duration, or cargo's default parallel test
/// threads will race on the same figure stack.
#[cfg(test)]
pub(crate) static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// A captured figure, ready to become a `display_data` event.
pub struct CapturedFigure {
    pub data: HashMap<String, serde_json::Value>,
}

fn ensure_current() {
    let mut figures = FIGURES.lock().unwrap();
    if figures.is_empty() {
        figures.push(Figure::blank());
    }
}

/// `forge_plot.figure()`: start a new, blank figure and make it current.
pub fn new_figure() {
    FIGURES.lock().unwrap().push(Figure::blank());
}

/// `forge_plot.title(text)`: attach a title to the current figure. Stored as
/// a PNG `tEXt` chunk rather than rendered onto the canvas, since there is no
/// font-rasterization anywhere in this dependency stack.
pub fn set_title(text: &str) {
    ensure_current();
    let mut figures = FIGURES.lock().unwrap();
    figures.last_mut().unwrap().title = Some(text.to_string());
}

/// `forge_plot.plot(x, y)`: a polyline through `(xs[i], ys[i])`.
pub fn plot_line(xs: &[f64], ys: &[f64]) {
    ensure_current();
    let mut figures = FIGURES.lock().unwrap();
    let fig = figures.last_mut().unwrap();
    let Some((to_px, _)) = pixel_mapper(xs, ys) else { return };

    for window in xs.iter().zip(ys.iter()).collect::<Vec<_>>().windows(2) {
        let (x0, y0) = to_px(*window[0].0, *window[0].1);
        let (x1, y1) = to_px(*window[1].0, *window[1].1);
        draw_line(&mut fig.canvas, x0, y0, x1, y1, LINE_COLOR);
    }
}

/// `forge_plot.scatter(x, y)`: a small filled square at each point.
pub fn plot_scatter(xs: &[f64], ys: &[f64]) {
    ensure_current();
    let mut figures = FIGURES.lock().unwrap();
    let fig = figures.last_mut().unwrap();
    let Some((to_px, _)) = pixel_mapper(xs, ys) else { return };

    for (&x, &y) in xs.iter().zip(ys.iter()) {
        let (px, py) = to_px(x, y);
        draw_point(&mut fig.canvas, px, py, POINT_COLOR);
    }
}

/// `forge_plot.bar(labels, values)`: one filled rectangle per value, evenly
/// spaced. `labels` only affects the bar count (text isn't rasterized).
pub fn plot_bar(label_count: usize, values: &[f64]) {
    ensure_current();
    if label_count == 0 || values.is_empty() {
        return;
    }
    let mut figures = FIGURES.lock().unwrap();
    let fig = figures.last_mut().unwrap();

    let plot_left = MARGIN;
    let plot_right = CANVAS_WIDTH as f64 - MARGIN;
    let plot_top = MARGIN;
    let plot_bottom = CANVAS_HEIGHT as f64 - MARGIN;

    let max_value = values.iter().cloned().fold(f64::MIN, f64::max).max(0.0);
    let min_value = values.iter().cloned().fold(f64::MAX, f64::min).min(0.0);
    let range = (max_value - min_value).max(f64::EPSILON);

    let slot_width = (plot_right - plot_left) / values.len() as f64;
    let zero_y = plot_bottom - ((0.0 - min_value) / range) * (plot_bottom - plot_top);

    for (i, &value) in values.iter().enumerate() {
        let bar_left = plot_left + slot_width * i as f64 + slot_width * 0.15;
        let bar_right = plot_left + slot_width * (i as f64 + 1.0) - slot_width * 0.15;
        let value_y = plot_bottom - ((value - min_value) / range) * (plot_bottom - plot_top);
        let (top, bottom) = if value_y <= zero_y { (value_y, zero_y) } else { (zero_y, value_y) };
        draw_rect_filled(
            &mut fig.canvas,
            bar_left as usize,
            top as usize,
            bar_right as usize,
            bottom as usize,
            BAR_COLOR,
        );
    }
}

/// `forge_plot.close('all')`: discard open figures without capturing them.
pub fn close_all() {
    FIGURES.lock().unwrap().clear();
}

/// Capture every open figure as `image/png`, then close them all. The
/// worker calls this once after every cell, regardless of outcome.
pub fn capture_and_clear_open_figures() -> Vec<CapturedFigure> {
    let figures = std::mem::take(&mut *FIGURES.lock().unwrap());
    figures
        .into_iter()
        .map(|fig| {
            let png = encode_png(CANVAS_WIDTH as u32, CANVAS_HEIGHT as u32, &fig.canvas, fig.title.as_deref());
            let encoded = BASE64_STANDARD.encode(&png);
            let mut data = HashMap::new();
            data.insert("image/png".to_string(), serde_json::Value::String(encoded));
            CapturedFigure { data }
        })
        .collect()
}

type PixelMapper<'a> = Box<dyn Fn(f64, f64) -> (i64, i64) + 'a>;

/// Build a data-space -> pixel-space mapping that fits `(xs, ys)` inside the
/// canvas with `MARGIN` on every side. Returns `None` for empty input.
fn pixel_mapper<'a>(xs: &'a [f64], ys: &'a [f64]) -> Option<(PixelMapper<'a>, ())> {
    if xs.is_empty() || ys.is_empty() {
        return None;
    }

    let (x_min, x_max) = min_max(xs);
    let (y_min, y_max) = min_max(ys);
    let x_range = (x_max - x_min).abs().max(f64::EPSILON);
    let y_range = (y_max - y_min).abs().max(f64::EPSILON);

    let plot_left = MARGIN;
    let plot_right = CANVAS_WIDTH as f64 - MARGIN;
    let plot_top = MARGIN;
    let plot_bottom = CANVAS_HEIGHT as f64 - MARGIN;

    let mapper = move |x: f64, y: f64| -> (i64, i64) {
        let px = plot_left + ((x - x_min) / x_range) * (plot_right - plot_left);
        let py = plot_bottom - ((y - y_min) / y_range) * (plot_bottom - plot_top);
        (px.round() as i64, py.round() as i64)
    };

    Some((Box::new(mapper), ()))
}

fn min_max(values: &[f64]) -> (f64, f64) {
    let mut min = f64::MAX;
    let mut max = f64::MIN;
    for &v in values {
        min = min.min(v);
        max = max.max(v);
    }
    (min, max)
}

fn set_pixel(canvas: &mut [u8], x: i64, y: i64, color: [u8; 3]) {
    if x < 0 || y < 0 || x as usize >= CANVAS_WIDTH || y as usize >= CANVAS_HEIGHT {
        return;
    }
    let idx = (y as usize * CANVAS_WIDTH + x as usize) * 3;
    canvas[idx..idx + 3].copy_from_slice(&color);
}

/// Bresenham's line algorithm.
fn draw_line(canvas: &mut [u8], x0: i64, y0: i64, x1: i64, y1: i64, color: [u8; 3]) {
    let (mut x0, mut y0) = (x0, y0);
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;

    loop {
        set_pixel(canvas, x0, y0, color);
        if x0 == x1 && y0 == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x0 += sx;
        }
        if e2 <= dx {
            err += dx;
            y0 += sy;
        }
    }
}

fn draw_point(canvas: &mut [u8], cx: i64, cy: i64, color: [u8; 3]) {
    for dy in -2..=2 {
        for dx in -2..=2 {
            set_pixel(canvas, cx + dx, cy + dy, color);
        }
    }
}

fn draw_rect_filled(canvas: &mut [u8], x0: usize, y0: usize, x1: usize, y1: usize, color: [u8; 3]) {
    let (x0, x1) = (x0.min(x1), x0.max(x1));
    let (y0, y1) = (y0.min(y1), y0.max(y1));
    for y in y0..=y1.min(CANVAS_HEIGHT - 1) {
        for x in x0..=x1.min(CANVAS_WIDTH - 1) {
            set_pixel(canvas, x as i64, y as i64, color);
        }
    }
}

fn draw_rect_outline(canvas: &mut [u8], x0: usize, y0: usize, x1: usize, y1: usize, color: [u8; 3]) {
    draw_line(canvas, x0 as i64, y0 as i64, x1 as i64, y0 as i64, color);
    draw_line(canvas, x0 as i64, y1 as i64, x1 as i64, y1 as i64, color);
    draw_line(canvas, x0 as i64, y0 as i64, x0 as i64, y1 as i64, color);
    draw_line(canvas, x1 as i64, y0 as i64, x1 as i64, y1 as i64, color);
}

// --- PNG encoding (truecolor, 8-bit, no interlace) -------------------------

fn encode_png(width: u32, height: u32, rgb: &[u8], title: Option<&str>) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&[137, 80, 78, 71, 13, 10, 26, 10]);

    let mut ihdr = Vec::with_capacity(13);
    ihdr.extend_from_slice(&width.to_be_bytes());
    ihdr.extend_from_slice(&height.to_be_bytes());
    ihdr.extend_from_slice(&[8, 2, 0, 0, 0]); // bit depth, color type (RGB), compression, filter, interlace
    write_chunk(&mut out, b"IHDR", &ihdr);

    if let Some(title) = title {
        let mut text = Vec::with_capacity(title.len() + 6);
        text.extend_from_slice(b"Title\0");
        text.extend_from_slice(title.as_bytes());
        write_chunk(&mut out, b"tEXt", &text);
    }

    let mut raw = Vec::with_capacity((width as usize * 3 + 1) * height as usize);
    for row in rgb.chunks_exact(width as usize * 3) {
        raw.push(0); // filter type: None
        raw.extend_from_slice(row);
    }
    let compressed = zlib_stored(&raw);
    write_chunk(&mut out, b"IDAT", &compressed);

    write_chunk(&mut out, b"IEND", &[]);
    out
}

fn write_chunk(out: &mut Vec<u8>, kind: &[u8; 4], data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    let start = out.len();
    out.extend_from_slice(kind);
    out.extend_from_slice(data);
    let crc = crc32(&out[start..]);
    out.extend_from_slice(&crc.to_be_bytes());
}

/// A valid zlib stream built entirely from uncompressed DEFLATE "stored"
/// blocks (max 65535 bytes each) — legal per RFC 1950/1951, just with a
/// compression ratio of exactly 1.
fn zlib_stored(data: &[u8]) -> Vec<u8> {
    let mut out = vec![0x78, 0x01]; // CMF, FLG (no compression, checked to be a multiple of 31)

    const CHUNK: usize = 65535;
    if data.is_empty() {
        out.push(0x01);
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0xFFFFu16.to_le_bytes());
    } else {
        let mut i = 0;
        while i < data.len() {
            let end = (i + CHUNK).min(data.len());
            let is_final = end == data.len();
            out.push(if is_final { 1 } else { 0 });
            let len = (end - i) as u16;
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(&(!len).to_le_bytes());
            out.extend_from_slice(&data[i..end]);
            i = end;
        }
    }

    out.extend_from_slice(&adler32(data).to_be_bytes());
    out
}

fn adler32(data: &[u8]) -> u32 {
    const MOD_ADLER: u32 = 65521;
    let (mut a, mut b) = (1u32, 0u32);
    for &byte in data {
        a = (a + byte as u32) % MOD_ADLER;
        b = (b + a) % MOD_ADLER;
    }
    (b << 16) | a
}

fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reset() {
        FIGURES.lock().unwrap().clear();
    }

    #[test]
    fn capture_with_no_figures_is_empty() {
        let _guard = TEST_LOCK.lock().unwrap();
        reset();
        assert!(capture_and_clear_open_figures().is_empty());
    }

    #[test]
    fn plot_then_capture_produces_one_png() {
        let _guard = TEST_LOCK.lock().unwrap();
        reset();
        plot_line(&[0.0, 1.0, 2.0], &[0.0, 1.0, 0.0]);
        let captured = capture_and_clear_open_figures();
        assert_eq!(captured.len(), 1);
        let png = captured[0].data.get("image/png").unwrap().as_str().unwrap();
        assert!(!png.is_empty());
        // Capturing clears the figure list.
        assert!(capture_and_clear_open_figures().is_empty());
    }

    #[test]
    fn multiple_figures_are_all_captured() {
        let _guard = TEST_LOCK.lock().unwrap();
        reset();
        new_figure();
        plot_scatter(&[0.0, 1.0], &[0.0, 1.0]);
        new_figure();
        plot_bar(2, &[3.0, -1.0]);
        assert_eq!(capture_and_clear_open_figures().len(), 2);
    }

    #[test]
    fn close_all_discards_without_capturing() {
        let _guard = TEST_LOCK.lock().unwrap();
        reset();
        plot_line(&[0.0, 1.0], &[0.0, 1.0]);
        close_all();
        assert!(capture_and_clear_open_figures().is_empty());
    }

    #[test]
    fn base64_matches_known_vector() {
        assert_eq!(BASE64_STANDARD.encode(b"man"), "bWFu");
        assert_eq!(BASE64_STANDARD.encode(b"ma"), "bWE=");
        assert_eq!(BASE64_STANDARD.encode(b"m"), "bQ==");
    }

    #[test]
    fn crc32_matches_known_vector() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn encoded_png_has_valid_signature_and_ihdr() {
        let png = encode_png(2, 2, &[255u8; 2 * 2 * 3], Some("t"));
        assert_eq!(&png[..8], &[137, 80, 78, 71, 13, 10, 26, 10]);
        assert_eq!(&png[12..16], b"IHDR");
    }
}
