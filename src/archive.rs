use crate::pattern::{Pattern, hsl_to_rgb};
use image::{ImageFormat, Rgba, RgbaImage};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Seek, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const DEFAULT_WIDTH: u32 = 1200;
pub const DEFAULT_HEIGHT: u32 = 630;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("image archive I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode image: {0}")]
    Encode(#[from] image::ImageError),
    #[error("image sequence exhausted in {0}")]
    Exhausted(PathBuf),
}

pub fn file_name(index: u32) -> String {
    format!("img-{index:03}.png")
}

fn parse_index(name: &str) -> Option<u32> {
    name.strip_prefix("img-")?.strip_suffix(".png")?.parse().ok()
}

/// Writes `img-001.png`, `img-002.png`, ... into one directory.
///
/// Each name is claimed with `create_new`, so two archives (or two processes)
/// sharing a directory skip each other's files instead of overwriting them.
pub struct ImageArchive {
    dir: PathBuf,
    width: u32,
    height: u32,
    next: Mutex<u32>,
}

impl ImageArchive {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, ArchiveError> {
        Self::with_size(dir, DEFAULT_WIDTH, DEFAULT_HEIGHT)
    }

    pub fn with_size(dir: impl Into<PathBuf>, width: u32, height: u32) -> Result<Self, ArchiveError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let mut highest = 0;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(index) = entry.file_name().to_str().and_then(parse_index) {
                highest = highest.max(index);
            }
        }
        debug!(dir = %dir.display(), next = highest + 1, "opened image archive");
        Ok(Self {
            dir,
            width: width.max(1),
            height: height.max(1),
            next: Mutex::new(highest + 1),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Claims the next free name and returns it with its freshly created file.
    fn reserve(&self) -> Result<(String, PathBuf, File), ArchiveError> {
        let mut next = self.next.lock();
        fs::create_dir_all(&self.dir)?;
        loop {
            let index = *next;
            *next = index
                .checked_add(1)
                .ok_or_else(|| ArchiveError::Exhausted(self.dir.clone()))?;
            let name = file_name(index);
            let path = self.dir.join(&name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((name, path, file)),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Renders the pattern and stores it under the next sequential name.
    pub fn store(&self, pattern: &Pattern) -> Result<String, ArchiveError> {
        let (name, path, file) = self.reserve()?;
        let image = render(pattern, self.width, self.height);
        let written =
            encode_png(&image, file).and_then(|file| file.sync_all().map_err(ArchiveError::from));
        if let Err(err) = written {
            remove_partial(&path);
            return Err(err);
        }
        debug!(file = %name, "stored pattern image");
        Ok(name)
    }

    /// Deletes a stored image whose submission was never recorded.
    ///
    /// If it was the most recent name handed out, the number is reused.
    pub fn discard(&self, name: &str) {
        let mut next = self.next.lock();
        let path = self.dir.join(name);
        if let Err(err) = fs::remove_file(&path) {
            warn!(error = %err, file = %path.display(), "failed to discard image");
            return;
        }
        if parse_index(name).is_some_and(|index| index.checked_add(1) == Some(*next)) {
            *next -= 1;
        }
        debug!(file = %name, "discarded pattern image");
    }
}

fn encode_png<W: Write + Seek>(image: &RgbaImage, out: W) -> Result<W, ArchiveError> {
    let mut writer = BufWriter::new(out);
    image.write_to(&mut writer, ImageFormat::Png)?;
    writer.into_inner().map_err(|err| ArchiveError::Io(err.into_error()))
}

fn remove_partial(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        warn!(error = %err, file = %path.display(), "failed to remove partial image");
    }
}

/// Rasterizes the pattern the way a browser paints its SVG with `slice` scaling.
pub fn render(pattern: &Pattern, width: u32, height: u32) -> RgbaImage {
    let start = hsl_to_rgb(pattern.hue_start, 0.7, 0.6);
    let end = hsl_to_rgb(pattern.hue_end, 0.7, 0.6);
    let (sin, cos) = pattern.angle.to_radians().sin_cos();

    let mut image = RgbaImage::from_fn(width, height, |x, y| {
        let u = (f64::from(x) + 0.5) / f64::from(width) - 0.5;
        let v = (f64::from(y) + 0.5) / f64::from(height) - 0.5;
        let t = (u * cos + v * sin + 0.5).clamp(0.0, 1.0);
        let mix = |a: u8, b: u8| (f64::from(a) + (f64::from(b) - f64::from(a)) * t).round() as u8;
        Rgba([mix(start[0], end[0]), mix(start[1], end[1]), mix(start[2], end[2]), 255])
    });

    // the 100x100 view box covers the canvas and is centred
    let scale = f64::from(width.max(height)) / 100.0;
    let offset_x = (f64::from(width) - 100.0 * scale) / 2.0;
    let offset_y = (f64::from(height) - 100.0 * scale) / 2.0;

    for particle in &pattern.particles {
        let color = hsl_to_rgb(particle.hue, 0.8, 0.7);
        let cx = offset_x + particle.x * scale;
        let cy = offset_y + particle.y * scale;
        let r = particle.radius * scale;
        let x0 = (cx - r).floor().max(0.0) as u32;
        let y0 = (cy - r).floor().max(0.0) as u32;
        let x1 = ((cx + r).ceil().max(0.0) as u32).min(width);
        let y1 = ((cy + r).ceil().max(0.0) as u32).min(height);
        for py in y0..y1 {
            for px in x0..x1 {
                let dx = f64::from(px) + 0.5 - cx;
                let dy = f64::from(py) + 0.5 - cy;
                if dx * dx + dy * dy > r * r {
                    continue;
                }
                let pixel = image.get_pixel_mut(px, py);
                blend(pixel, color, particle.opacity);
            }
        }
    }
    image
}

fn blend(pixel: &mut Rgba<u8>, color: [u8; 3], alpha: f64) {
    for (channel, source) in pixel.0.iter_mut().zip(color) {
        let mixed = f64::from(source) * alpha + f64::from(*channel) * (1.0 - alpha);
        *channel = mixed.round().clamp(0.0, 255.0) as u8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn names_are_sequential_and_zero_padded() {
        let dir = tempfile::tempdir().unwrap();
        let archive = ImageArchive::with_size(dir.path().join("images"), 64, 34).unwrap();
        let pattern = Pattern::generate("I love this school");
        assert_eq!(archive.store(&pattern).unwrap(), "img-001.png");
        assert_eq!(archive.store(&pattern).unwrap(), "img-002.png");
        let stored = image::open(archive.dir().join("img-002.png")).unwrap();
        assert_eq!((stored.width(), stored.height()), (64, 34));
    }

    #[test]
    fn reopening_continues_after_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("img-041.png"), b"").unwrap();
        fs::write(dir.path().join("notes.txt"), b"").unwrap();
        let archive = ImageArchive::with_size(dir.path(), 16, 16).unwrap();
        assert_eq!(archive.store(&Pattern::generate("x")).unwrap(), "img-042.png");
    }

    #[test]
    fn concurrent_stores_never_share_a_name() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Arc::new(ImageArchive::with_size(dir.path(), 32, 32).unwrap());
        let names: Vec<String> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|t| {
                    let archive = Arc::clone(&archive);
                    scope.spawn(move || {
                        (0..5)
                            .map(|i| archive.store(&Pattern::generate(&format!("{t}/{i}"))).unwrap())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });
        let unique: HashSet<_> = names.iter().collect();
        assert_eq!(unique.len(), 40);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 40);
    }

    #[test]
    fn two_archives_on_one_directory_skip_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let first = ImageArchive::with_size(dir.path(), 8, 8).unwrap();
        let second = ImageArchive::with_size(dir.path(), 8, 8).unwrap();
        let pattern = Pattern::generate("shared");
        assert_eq!(first.store(&pattern).unwrap(), "img-001.png");
        assert_eq!(second.store(&pattern).unwrap(), "img-002.png");
        assert_eq!(first.store(&pattern).unwrap(), "img-003.png");
    }

    #[test]
    fn missing_directory_is_recreated() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("images");
        let archive = ImageArchive::with_size(&images, 8, 8).unwrap();
        fs::remove_dir(&images).unwrap();
        assert_eq!(archive.store(&Pattern::generate("again")).unwrap(), "img-001.png");
        assert!(images.join("img-001.png").exists());
    }

    /// Accepts a few bytes, then reports a full disk.
    struct FullDisk {
        written: Vec<u8>,
        capacity: usize,
    }

    impl Write for FullDisk {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.written.len() + buf.len() > self.capacity {
                return Err(io::Error::other("no space left on device"));
            }
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Seek for FullDisk {
        fn seek(&mut self, _pos: io::SeekFrom) -> io::Result<u64> {
            Ok(self.written.len() as u64)
        }
    }

    #[test]
    fn buffered_tail_errors_are_reported() {
        let image = render(&Pattern::generate("tail"), 8, 8);
        let disk = FullDisk {
            written: Vec::new(),
            capacity: 16,
        };
        assert!(encode_png(&image, disk).is_err());
    }

    #[test]
    fn encoded_png_reaches_the_writer() {
        let image = render(&Pattern::generate("tail"), 8, 8);
        let bytes = encode_png(&image, io::Cursor::new(Vec::new())).unwrap().into_inner();
        assert!(bytes.starts_with(b"\x89PNG\r\n\x1a\n"));
    }

    #[test]
    fn discarding_the_latest_image_reuses_its_number() {
        let dir = tempfile::tempdir().unwrap();
        let archive = ImageArchive::with_size(dir.path(), 8, 8).unwrap();
        let pattern = Pattern::generate("orphan");
        assert_eq!(archive.store(&pattern).unwrap(), "img-001.png");
        let name = archive.store(&pattern).unwrap();
        archive.discard(&name);
        assert!(!dir.path().join(&name).exists());
        assert_eq!(archive.store(&pattern).unwrap(), "img-002.png");
    }

    #[test]
    fn discarding_an_older_image_keeps_the_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let archive = ImageArchive::with_size(dir.path(), 8, 8).unwrap();
        let pattern = Pattern::generate("orphan");
        let first = archive.store(&pattern).unwrap();
        archive.store(&pattern).unwrap();
        archive.discard(&first);
        assert!(!dir.path().join(&first).exists());
        assert_eq!(archive.store(&pattern).unwrap(), "img-003.png");
    }

    #[test]
    fn render_is_deterministic() {
        let pattern = Pattern::generate("deterministic");
        assert_eq!(render(&pattern, 40, 21), render(&pattern, 40, 21));
    }
}
