//! Shared region-of-interest polygon.
//!
//! The pipeline reads the polygon on every tick while the HTTP configuration
//! endpoint may replace it at any time. The value is swapped as a whole, so a
//! reader sees either the old polygon or the new one.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use tracing::{info, warn};

use crate::geometry::{GeometryError, Point, Quadrilateral};

#[derive(Debug)]
pub struct RoiStore {
    current: ArcSwap<Quadrilateral>,
    path: Option<PathBuf>,
    /// Held across swap and save so the file always matches the last swap.
    writer: Mutex<()>,
}

impl RoiStore {
    pub fn new(initial: Quadrilateral) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
            path: None,
            writer: Mutex::new(()),
        }
    }

    /// Store seeded from `path` when it holds a valid polygon, otherwise from
    /// `fallback`. Later updates are written back to `path`.
    pub fn with_persistence(fallback: Quadrilateral, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let initial = match load(&path) {
            Ok(Some(quad)) => {
                info!("Loaded region of interest from {}", path.display());
                quad
            }
            Ok(None) => fallback,
            Err(err) => {
                warn!(
                    "Ignoring region of interest in {}: {err:#}",
                    path.display()
                );
                fallback
            }
        };
        Self {
            current: ArcSwap::from_pointee(initial),
            path: Some(path),
            writer: Mutex::new(()),
        }
    }

    pub fn get(&self) -> Quadrilateral {
        **self.current.load()
    }

    /// Validate and commit a new polygon.
    ///
    /// Persistence failures are logged; the in-memory value is already
    /// committed at that point and stays in effect. Writes the file
    /// synchronously when persistence is enabled.
    pub fn set(&self, points: &[Point]) -> Result<Quadrilateral, GeometryError> {
        let quad = Quadrilateral::try_from(points)?;
        let _writer = self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.current.store(Arc::new(quad));
        if let Some(path) = &self.path {
            if let Err(err) = save(path, &quad) {
                warn!(
                    "Failed to persist region of interest to {}: {err:#}",
                    path.display()
                );
            }
        }
        Ok(quad)
    }
}

fn load(path: &Path) -> Result<Option<Quadrilateral>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let quad = serde_json::from_slice(&data).context("parsing region of interest")?;
    Ok(Some(quad))
}

fn save(path: &Path, quad: &Quadrilateral) -> Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    let mut file = fs::File::create(&tmp_path)
        .with_context(|| format!("creating {}", tmp_path.display()))?;
    serde_json::to_writer_pretty(&mut file, quad)?;
    file.write_all(b"\n")?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(offset: i32) -> Vec<Point> {
        vec![
            Point::new(offset, offset),
            Point::new(offset + 10, offset),
            Point::new(offset + 10, offset + 10),
            Point::new(offset, offset + 10),
        ]
    }

    fn store(offset: i32) -> RoiStore {
        RoiStore::new(Quadrilateral::try_from(square(offset).as_slice()).unwrap())
    }

    #[test]
    fn set_replaces_whole_polygon() {
        let store = store(0);
        store.set(&square(50)).unwrap();
        assert_eq!(store.get().points().to_vec(), square(50));
    }

    #[test]
    fn invalid_update_keeps_previous_polygon() {
        let store = store(0);
        assert_eq!(
            store.set(&square(5)[..3]),
            Err(GeometryError::WrongPointCount(3))
        );
        let collinear = [
            Point::new(0, 0),
            Point::new(1, 0),
            Point::new(2, 0),
            Point::new(0, 4),
        ];
        assert!(matches!(
            store.set(&collinear),
            Err(GeometryError::InvalidGeometry(_))
        ));
        assert_eq!(store.get().points().to_vec(), square(0));
    }

    #[test]
    fn persisted_polygon_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roi.json");
        let fallback = Quadrilateral::try_from(square(0).as_slice()).unwrap();

        let first = RoiStore::with_persistence(fallback, &path);
        assert_eq!(first.get(), fallback);
        first.set(&square(20)).unwrap();

        let second = RoiStore::with_persistence(fallback, &path);
        assert_eq!(second.get().points().to_vec(), square(20));
    }

    #[test]
    fn corrupt_file_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roi.json");
        fs::write(&path, b"{\"points\": [1, 2]}").unwrap();
        let fallback = Quadrilateral::try_from(square(3).as_slice()).unwrap();
        assert_eq!(RoiStore::with_persistence(fallback, &path).get(), fallback);
    }

    #[test]
    fn concurrent_updates_leave_file_matching_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roi.json");
        let fallback = Quadrilateral::try_from(square(0).as_slice()).unwrap();
        let store = Arc::new(RoiStore::with_persistence(fallback, &path));

        let writers: Vec<_> = (1..=4)
            .map(|offset| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        store.set(&square(offset * 10)).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        assert_eq!(load(&path).unwrap(), Some(store.get()));
    }

    #[test]
    fn concurrent_readers_never_see_torn_values() {
        let store = Arc::new(store(0));
        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..500 {
                    store.set(&square(i % 2 * 100)).unwrap();
                }
            })
        };
        for _ in 0..2000 {
            let points = store.get().points().to_vec();
            assert!(points == square(0) || points == square(100));
        }
        writer.join().unwrap();
    }
}
