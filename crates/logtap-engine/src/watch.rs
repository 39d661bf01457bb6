//! Directory-tail input.
//!
//! [`DirReader`] watches directory trees and tails every regular file under
//! them behind a plain [`Read`] interface: `read` blocks until one of the
//! tailed files grows and returns the newly written bytes. Files are opened
//! at their current end, so only data written after they come under watch
//! is ever emitted.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::mpsc;

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, trace};

/// Tails an unbounded set of growing files behind a single read interface.
///
/// Filesystem events drive everything: a write to a tailed file yields its
/// new bytes from `read`; a created file (or directory) comes under watch;
/// a removed file is dropped. The reader is endless while watching —
/// `read` only returns `Ok(0)` after [`DirReader::close`].
pub struct DirReader {
    watcher: RecommendedWatcher,
    events: mpsc::Receiver<notify::Result<Event>>,
    files: HashMap<PathBuf, File>,
    closed: bool,
}

impl DirReader {
    /// Create a reader with no watched directories.
    ///
    /// # Errors
    ///
    /// Fails when the platform watcher cannot be created.
    pub fn new() -> io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let watcher = notify::recommended_watcher(move |event| {
            let _ = tx.send(event);
        })
        .map_err(io::Error::other)?;

        Ok(Self {
            watcher,
            events: rx,
            files: HashMap::new(),
            closed: false,
        })
    }

    /// Add a directory to the watched set and recursively tail every
    /// regular file currently under it.
    ///
    /// # Errors
    ///
    /// Fails when the directory cannot be watched or scanned.
    pub fn watch(&mut self, dir: &Path) -> io::Result<()> {
        self.watcher
            .watch(dir, RecursiveMode::Recursive)
            .map_err(io::Error::other)?;
        debug!(dir = %dir.display(), "watching directory");
        self.scan_dir(dir)
    }

    /// Drop all tailed files and make subsequent `read`s return `Ok(0)`.
    pub fn close(&mut self) {
        self.files.clear();
        self.closed = true;
    }

    /// Number of files currently tailed.
    #[must_use]
    pub fn tailed_count(&self) -> usize {
        self.files.len()
    }

    fn scan_dir(&mut self, dir: &Path) -> io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.scan_dir(&path)?;
            } else if file_type.is_file() {
                self.add_file(&path)?;
            }
        }
        Ok(())
    }

    // Tailing starts at the current end: only newly written data is read.
    // Adding the same file twice is a no-op.
    fn add_file(&mut self, path: &Path) -> io::Result<()> {
        if self.files.contains_key(path) {
            return Ok(());
        }
        let mut file = File::open(path)?;
        file.seek(SeekFrom::End(0))?;
        trace!(path = %path.display(), "tailing file");
        self.files.insert(path.to_path_buf(), file);
        Ok(())
    }

    fn add_path(&mut self, path: &Path) -> io::Result<()> {
        let Ok(metadata) = std::fs::metadata(path) else {
            // created and removed before we got here
            return Ok(());
        };
        if metadata.is_dir() {
            // the recursive watch already covers new subdirectories;
            // only their existing contents need scanning
            self.scan_dir(path)
        } else if metadata.is_file() {
            self.add_file(path)
        } else {
            Ok(())
        }
    }

    fn read_file(&mut self, path: &Path, buf: &mut [u8]) -> io::Result<usize> {
        if !self.files.contains_key(path) {
            // a write can be the first event we see for a file
            self.add_path(path)?;
        }
        match self.files.get_mut(path) {
            Some(file) => file.read(buf),
            None => Ok(0),
        }
    }
}

impl Read for DirReader {
    /// Block on the event stream until newly written bytes are available.
    /// Returns `Ok(0)` only once the reader is closed.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Ok(0);
        }
        loop {
            let Ok(event) = self.events.recv() else {
                // watcher thread is gone
                return Ok(0);
            };
            let event = event.map_err(io::Error::other)?;
            match event.kind {
                EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any) => {
                    for path in &event.paths {
                        let n = self.read_file(path, buf)?;
                        if n > 0 {
                            return Ok(n);
                        }
                    }
                }
                EventKind::Create(_) => {
                    for path in &event.paths {
                        self.add_path(path)?;
                    }
                }
                EventKind::Remove(_) => {
                    for path in &event.paths {
                        if self.files.remove(path).is_some() {
                            trace!(path = %path.display(), "dropped removed file");
                        }
                    }
                }
                _ => {}
            }
        }
    }
}
