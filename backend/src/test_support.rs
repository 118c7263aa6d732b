//! Test utilities for the crate.
//!
//! Shared by unit tests (in `src/`) and integration tests (in `tests/`).
//! Compiled for tests and when the `test-support` feature is enabled.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, TimeDelta, Utc};
use mockable::Clock;
use tempfile::TempDir;

use crate::domain::ports::{NotificationError, NotificationSender};
use crate::domain::{BackoffJitter, Contact, RetrySleeper, StorageLayout};

pub mod cap_fs {
    //! Capability-safe filesystem helpers for tests.
    //!
    //! The backend forbids direct `std::fs` calls. These helpers provide common
    //! read/write/existence/remove operations built on `cap_std::fs::Dir` so
    //! test suites can share consistent, policy-compliant file access.

    use std::ffi::OsString;
    use std::io;
    use std::path::Path;

    use cap_std::{ambient_authority, fs::Dir};

    /// Read a UTF-8 text file through `cap_std`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use identity_isolation::test_support::cap_fs::{read_file_to_string, write_file};
    ///
    /// let path = std::env::temp_dir().join("cap-fs-read-example.txt");
    /// write_file(&path, b"hello\n")?;
    ///
    /// let content = read_file_to_string(&path)?;
    /// assert_eq!(content, "hello\n");
    /// # Ok::<(), std::io::Error>(())
    /// ```
    pub fn read_file_to_string(path: &Path) -> io::Result<String> {
        let (parent, file_name) = parent_and_file_name(path)?;
        let directory = Dir::open_ambient_dir(parent, ambient_authority())?;
        directory.read_to_string(Path::new(&file_name))
    }

    /// Write bytes to a file through `cap_std`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use identity_isolation::test_support::cap_fs::{read_file_to_string, write_file};
    ///
    /// let path = std::env::temp_dir().join("cap-fs-write-example.txt");
    /// write_file(&path, b"snapshot\n")?;
    /// assert_eq!(read_file_to_string(&path)?, "snapshot\n");
    /// # Ok::<(), std::io::Error>(())
    /// ```
    pub fn write_file(path: &Path, contents: &[u8]) -> io::Result<()> {
        let (parent, file_name) = parent_and_file_name(path)?;
        let directory = Dir::open_ambient_dir(parent, ambient_authority())?;
        directory.write(Path::new(&file_name), contents)
    }

    /// Return true when `path` exists, false when it does not.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use identity_isolation::test_support::cap_fs::{path_exists, write_file};
    ///
    /// let path = std::env::temp_dir().join("cap-fs-exists-example.txt");
    /// write_file(&path, b"exists\n")?;
    /// assert!(path_exists(&path));
    /// # Ok::<(), std::io::Error>(())
    /// ```
    pub fn path_exists(path: &Path) -> bool {
        let Ok((parent, file_name)) = parent_and_file_name(path) else {
            return false;
        };
        let Ok(directory) = Dir::open_ambient_dir(parent, ambient_authority()) else {
            return false;
        };
        directory.exists(Path::new(&file_name))
    }

    /// Remove a directory tree, treating a missing path as success.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use identity_isolation::test_support::cap_fs::{path_exists, remove_directory, write_file};
    /// use cap_std::{ambient_authority, fs::Dir};
    ///
    /// let directory = std::env::temp_dir().join("cap-fs-remove-example");
    /// Dir::create_ambient_dir_all(&directory, ambient_authority())?;
    /// let file = directory.join("entry.txt");
    /// write_file(&file, b"cleanup\n")?;
    /// assert!(path_exists(&file));
    ///
    /// remove_directory(&directory)?;
    /// assert!(!path_exists(&file));
    /// # Ok::<(), std::io::Error>(())
    /// ```
    pub fn remove_directory(path: &Path) -> io::Result<()> {
        let (parent, directory_name) = parent_and_file_name(path)?;
        let directory = match Dir::open_ambient_dir(parent, ambient_authority()) {
            Ok(directory) => directory,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(error) => return Err(error),
        };
        match directory.remove_dir_all(Path::new(&directory_name)) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error),
        }
    }

    fn parent_and_file_name(path: &Path) -> io::Result<(&Path, OsString)> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        let file_name = path.file_name().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "path must include a file or directory name",
            )
        })?;
        Ok((parent, file_name.to_os_string()))
    }
}


/// Clock that only moves when told to.
pub struct MutableClock(Mutex<DateTime<Utc>>);

impl MutableClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self(Mutex::new(now))
    }

    pub fn advance(&self, delta: Duration) {
        let delta = match TimeDelta::from_std(delta) {
            Ok(delta) => delta,
            Err(error) => {
                panic!("failed to convert Duration to TimeDelta: {error}; delta={delta:?}",)
            }
        };
        *self.lock_clock() += delta;
    }

    pub fn advance_seconds(&self, seconds: i64) {
        *self.lock_clock() += TimeDelta::seconds(seconds);
    }

    fn lock_clock(&self) -> std::sync::MutexGuard<'_, DateTime<Utc>> {
        match self.0.lock() {
            Ok(guard) => guard,
            Err(_) => panic!("clock mutex"),
        }
    }
}

impl Clock for MutableClock {
    fn local(&self) -> DateTime<Local> {
        self.utc().with_timezone(&Local)
    }

    fn utc(&self) -> DateTime<Utc> {
        *self.lock_clock()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateSleeper;

#[async_trait]
impl RetrySleeper for ImmediateSleeper {
    async fn sleep(&self, _duration: Duration) {}
}

#[derive(Default)]
pub struct RecordingSleeper(pub Mutex<Vec<Duration>>);

#[async_trait]
impl RetrySleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        let mut entries = match self.0.lock() {
            Ok(entries) => entries,
            Err(_) => panic!("sleeper mutex"),
        };
        entries.push(duration);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoJitter;

impl BackoffJitter for NoJitter {
    fn jittered_delay(&self, base: Duration, _attempt: u32, _now: DateTime<Utc>) -> Duration {
        base
    }
}

/// Notification sender that keeps every message instead of delivering it.
#[derive(Default)]
pub struct RecordingNotificationSender {
    sent: Mutex<Vec<(Contact, String)>>,
    fail: bool,
}

impl RecordingNotificationSender {
    /// A sender whose deliveries all fail after being recorded.
    pub fn failing() -> Self {
        Self {
            sent: Mutex::default(),
            fail: true,
        }
    }

    /// Every `(contact, message)` handed to the sender, oldest first.
    pub fn sent(&self) -> Vec<(Contact, String)> {
        match self.sent.lock() {
            Ok(sent) => sent.clone(),
            Err(_) => panic!("notification mutex"),
        }
    }

    /// Code embedded in the latest message (`... code is XXXX. ...`).
    pub fn last_code(&self) -> Option<String> {
        let (_, message) = self.sent().pop()?;
        let (_, tail) = message.split_once("code is ")?;
        let (code, _) = tail.split_once('.')?;
        Some(code.to_owned())
    }
}

#[async_trait]
impl NotificationSender for RecordingNotificationSender {
    async fn send(&self, contact: &Contact, message: &str) -> Result<(), NotificationError> {
        match self.sent.lock() {
            Ok(mut sent) => sent.push((contact.clone(), message.to_owned())),
            Err(_) => panic!("notification mutex"),
        }
        if self.fail {
            return Err(NotificationError::delivery("smtp relay refused the message"));
        }
        Ok(())
    }
}

/// Storage layout under a fresh temporary directory; the directory lives as
/// long as the returned guard.
pub fn temp_layout() -> (TempDir, StorageLayout) {
    let tmp = match tempfile::tempdir() {
        Ok(tmp) => tmp,
        Err(error) => panic!("tempdir: {error}"),
    };
    let layout = StorageLayout::new(tmp.path().join("data"));
    (tmp, layout)
}
