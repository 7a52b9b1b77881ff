//! Transaction status journal
//!
//! The journal records the outcome of every transaction ever issued. Layout:
//!
//! ```text
//! +------------------+--------+--------+-----+
//! | counter (u64 BE) | xid 1  | xid 2  | ... |
//! +------------------+--------+--------+-----+
//!       8 bytes        1 byte   1 byte
//! ```
//!
//! The header holds the highest xid issued so far, so a healthy file is always
//! exactly `8 + counter` bytes long. Xid 0 is reserved and has no slot.

use crate::error::{DbError, DbResult};
use crate::storage::codec::{self, U64_LEN};
use parking_lot::Mutex;
use std::ffi::OsString;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info};

/// Header length in bytes
pub const XID_HEADER_LEN: u64 = U64_LEN as u64;

/// Bytes per transaction slot
const XID_SLOT_LEN: u64 = 1;

/// Suffix appended to a journal's base path
pub const XID_SUFFIX: &str = ".xid";

/// Transaction ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Xid(pub u64);

impl Xid {
    /// The "no transaction" id. Never active, committed or aborted.
    pub const SUPER: Xid = Xid(0);

    pub fn is_super(self) -> bool {
        self == Self::SUPER
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Xid {
    fn from(value: u64) -> Self {
        Xid(value)
    }
}

/// Transaction states as stored in a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransactionStatus {
    Active = 0,
    Committed = 1,
    Aborted = 2,
}

impl TransactionStatus {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Active),
            1 => Some(Self::Committed),
            2 => Some(Self::Aborted),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Committed and aborted transactions never change status again
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "active",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Path of the journal file for a base path (`<base>.xid`)
pub fn xid_file_path<P: AsRef<Path>>(base: P) -> PathBuf {
    let mut path = OsString::from(base.as_ref().as_os_str());
    path.push(XID_SUFFIX);
    PathBuf::from(path)
}

/// Durable per-transaction status journal
#[derive(Debug)]
pub struct TransactionLog {
    path: PathBuf,
    file: File,
    /// Highest issued xid, published once its slot and the header are durable
    counter: AtomicU64,
    /// Serializes xid allocation and header writes
    counter_lock: Mutex<()>,
    /// Serializes status transitions so a slot leaves `Active` only once
    update_lock: Mutex<()>,
}

impl TransactionLog {
    /// Create a new journal at `<base>.xid`
    pub fn create<P: AsRef<Path>>(base: P) -> DbResult<Self> {
        Self::create_at(xid_file_path(base))
    }

    /// Open the existing journal at `<base>.xid`
    pub fn open<P: AsRef<Path>>(base: P) -> DbResult<Self> {
        Self::open_at(xid_file_path(base))
    }

    /// Create a new journal file at exactly `path`.
    ///
    /// Fails with [`DbError::FileExists`] if anything is already there.
    pub fn create_at<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let path = path.as_ref().to_path_buf();

        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(DbError::FileExists(path));
            }
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                return Err(DbError::FileCannotReadWrite(path));
            }
            Err(e) => return Err(e.into()),
        };

        // Empty header: no transaction issued yet
        write_all_at(&file, &codec::encode_u64(0), 0)?;
        file.sync_all()?;

        info!(path = %path.display(), "Created transaction journal");
        Ok(Self::from_parts(path, file, 0))
    }

    /// Open an existing journal file at exactly `path` and verify its length.
    ///
    /// The file must be readable and writable. A length that disagrees with
    /// the header counter fails with [`DbError::BadXidFile`]; such a journal
    /// must not be used.
    pub fn open_at<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let path = path.as_ref().to_path_buf();

        let metadata = match fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(DbError::FileNotExists(path));
            }
            Err(e) => return Err(e.into()),
        };
        if !metadata.is_file() || metadata.permissions().readonly() {
            return Err(DbError::FileCannotReadWrite(path));
        }

        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(DbError::FileNotExists(path));
            }
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                return Err(DbError::FileCannotReadWrite(path));
            }
            Err(e) => return Err(e.into()),
        };

        let counter = match Self::check_counter(&file) {
            Ok(counter) => counter,
            Err(e) => {
                error!(path = %path.display(), error = %e, "Transaction journal failed integrity check");
                return Err(e);
            }
        };

        info!(path = %path.display(), last_xid = counter, "Opened transaction journal");
        Ok(Self::from_parts(path, file, counter))
    }

    fn from_parts(path: PathBuf, file: File, counter: u64) -> Self {
        Self {
            path,
            file,
            counter: AtomicU64::new(counter),
            counter_lock: Mutex::new(()),
            update_lock: Mutex::new(()),
        }
    }

    /// Read the header counter and compare the length it implies with the real one
    fn check_counter(file: &File) -> DbResult<u64> {
        let len = file.metadata()?.len();
        if len < XID_HEADER_LEN {
            return Err(DbError::BadXidFile(format!(
                "file is {len} bytes, shorter than its {XID_HEADER_LEN}-byte header"
            )));
        }

        let mut header = [0u8; U64_LEN];
        read_exact_at(file, &mut header, 0)?;
        let counter = codec::decode_u64(&header)?;

        match slot_offset(counter.saturating_add(1)) {
            Some(expected) if expected == len => Ok(counter),
            _ => Err(DbError::BadXidFile(format!(
                "header counter {counter} does not match file length {len}"
            ))),
        }
    }

    /// Issue a new transaction id and record it as active.
    ///
    /// The slot and the header are both durable when this returns.
    pub fn begin(&self) -> DbResult<Xid> {
        let _guard = self.counter_lock.lock();

        let xid = self
            .counter
            .load(Ordering::Acquire)
            .checked_add(1)
            .map(Xid)
            .ok_or_else(|| DbError::Transaction("Transaction ids exhausted".into()))?;

        self.write_status(xid, TransactionStatus::Active)?;

        write_all_at(&self.file, &codec::encode_u64(xid.0), 0)?;
        self.file.sync_all()?;

        self.counter.store(xid.0, Ordering::Release);

        debug!(xid = xid.0, "Began transaction");
        Ok(xid)
    }

    /// Mark a transaction as committed
    pub fn commit(&self, xid: Xid) -> DbResult<()> {
        self.finish(xid, TransactionStatus::Committed)
    }

    /// Mark a transaction as aborted
    pub fn abort(&self, xid: Xid) -> DbResult<()> {
        self.finish(xid, TransactionStatus::Aborted)
    }

    fn finish(&self, xid: Xid, status: TransactionStatus) -> DbResult<()> {
        self.check_issued(xid)?;

        let _guard = self.update_lock.lock();
        let current = self.read_status(xid)?;
        if current.is_terminal() {
            return Err(DbError::Transaction(format!(
                "Transaction {xid} is already {current}"
            )));
        }

        self.write_status(xid, status)?;

        debug!(xid = xid.0, %status, "Finished transaction");
        Ok(())
    }

    /// Read the recorded status of an issued transaction
    pub fn status(&self, xid: Xid) -> DbResult<TransactionStatus> {
        self.check_issued(xid)?;
        self.read_status(xid)
    }

    pub fn is_active(&self, xid: Xid) -> DbResult<bool> {
        self.has_status(xid, TransactionStatus::Active)
    }

    pub fn is_committed(&self, xid: Xid) -> DbResult<bool> {
        self.has_status(xid, TransactionStatus::Committed)
    }

    pub fn is_aborted(&self, xid: Xid) -> DbResult<bool> {
        self.has_status(xid, TransactionStatus::Aborted)
    }

    fn has_status(&self, xid: Xid, status: TransactionStatus) -> DbResult<bool> {
        if xid.is_super() {
            return Ok(false);
        }
        Ok(self.status(xid)? == status)
    }

    /// Status of every issued transaction, in xid order
    pub fn scan(&self) -> DbResult<Vec<(Xid, TransactionStatus)>> {
        let counter = self.counter.load(Ordering::Acquire);
        let len = usize::try_from(counter)
            .map_err(|_| DbError::InvalidOperation(format!("Journal too large to scan: {counter}")))?;

        let mut slots = vec![0u8; len];
        read_exact_at(&self.file, &mut slots, XID_HEADER_LEN)?;

        slots
            .into_iter()
            .zip(1..)
            .map(|(byte, xid)| {
                TransactionStatus::from_byte(byte)
                    .map(|status| (Xid(xid), status))
                    .ok_or_else(|| unknown_status(Xid(xid), byte))
            })
            .collect()
    }

    /// Highest xid issued so far (`Xid::SUPER` for a fresh journal)
    pub fn last_xid(&self) -> Xid {
        Xid(self.counter.load(Ordering::Acquire))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and close the journal
    pub fn close(self) -> DbResult<()> {
        self.file.sync_all()?;
        info!(path = %self.path.display(), last_xid = self.last_xid().0, "Closed transaction journal");
        Ok(())
    }

    fn check_issued(&self, xid: Xid) -> DbResult<()> {
        if xid.is_super() || xid.0 > self.counter.load(Ordering::Acquire) {
            return Err(DbError::InvalidXid(xid.0));
        }
        Ok(())
    }

    fn read_status(&self, xid: Xid) -> DbResult<TransactionStatus> {
        let offset = slot_offset(xid.0).ok_or(DbError::InvalidXid(xid.0))?;
        let mut byte = [0u8; 1];
        read_exact_at(&self.file, &mut byte, offset)?;
        TransactionStatus::from_byte(byte[0]).ok_or_else(|| unknown_status(xid, byte[0]))
    }

    fn write_status(&self, xid: Xid, status: TransactionStatus) -> DbResult<()> {
        let offset = slot_offset(xid.0).ok_or(DbError::InvalidXid(xid.0))?;
        write_all_at(&self.file, &[status.as_byte()], offset)?;
        self.file.sync_data()?;
        Ok(())
    }
}

/// Byte offset of an xid's slot; `None` for xid 0 or on overflow
fn slot_offset(xid: u64) -> Option<u64> {
    xid.checked_sub(1)?
        .checked_mul(XID_SLOT_LEN)?
        .checked_add(XID_HEADER_LEN)
}

fn unknown_status(xid: Xid, byte: u8) -> DbError {
    DbError::BadXidFile(format!("slot for xid {xid} holds unknown status {byte}"))
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => return Err(ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                let rest = buf;
                buf = &mut rest[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset) {
            Ok(0) => return Err(ErrorKind::WriteZero.into()),
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;
    use tempfile::tempdir;

    #[test]
    fn test_begin_allocates_sequential_active_xids() {
        let temp_dir = tempdir().unwrap();
        let log = TransactionLog::create(temp_dir.path().join("db")).unwrap();
        assert_eq!(log.last_xid(), Xid::SUPER);

        for expected in 1..=3 {
            let xid = log.begin().unwrap();
            assert_eq!(xid, Xid(expected));
            assert!(log.is_active(xid).unwrap());
            assert!(!log.is_committed(xid).unwrap());
            assert!(!log.is_aborted(xid).unwrap());
        }
        assert_eq!(log.last_xid(), Xid(3));
    }

    #[test]
    fn test_commit_and_abort_are_terminal() {
        let temp_dir = tempdir().unwrap();
        let log = TransactionLog::create(temp_dir.path().join("db")).unwrap();

        let committed = log.begin().unwrap();
        let aborted = log.begin().unwrap();
        log.commit(committed).unwrap();
        log.abort(aborted).unwrap();

        assert_eq!(log.status(committed).unwrap(), TransactionStatus::Committed);
        assert!(!log.is_active(committed).unwrap());
        assert!(!log.is_aborted(committed).unwrap());
        assert_eq!(log.status(aborted).unwrap(), TransactionStatus::Aborted);

        // No second transition, in either direction
        assert!(matches!(log.abort(committed), Err(DbError::Transaction(_))));
        assert!(matches!(log.commit(aborted), Err(DbError::Transaction(_))));
        assert!(matches!(log.commit(committed), Err(DbError::Transaction(_))));
        assert!(log.is_committed(committed).unwrap());
        assert!(log.is_aborted(aborted).unwrap());
    }

    #[test]
    fn test_super_xid_has_no_status() {
        let temp_dir = tempdir().unwrap();
        let log = TransactionLog::create(temp_dir.path().join("db")).unwrap();
        log.begin().unwrap();

        assert!(!log.is_active(Xid::SUPER).unwrap());
        assert!(!log.is_committed(Xid::SUPER).unwrap());
        assert!(!log.is_aborted(Xid::SUPER).unwrap());
        assert!(matches!(log.commit(Xid::SUPER), Err(DbError::InvalidXid(0))));
        assert!(matches!(log.status(Xid::SUPER), Err(DbError::InvalidXid(0))));
    }

    #[test]
    fn test_unissued_xid_is_rejected() {
        let temp_dir = tempdir().unwrap();
        let log = TransactionLog::create(temp_dir.path().join("db")).unwrap();
        log.begin().unwrap();

        assert!(matches!(log.commit(Xid(5)), Err(DbError::InvalidXid(5))));
        assert!(matches!(log.is_active(Xid(2)), Err(DbError::InvalidXid(2))));

        // Nothing was written past the last slot
        let len = fs::metadata(log.path()).unwrap().len();
        assert_eq!(len, XID_HEADER_LEN + 1);
    }

    #[test]
    fn test_file_layout() {
        let temp_dir = tempdir().unwrap();
        let log = TransactionLog::create(temp_dir.path().join("db")).unwrap();
        assert_eq!(log.path(), temp_dir.path().join("db.xid"));

        let first = log.begin().unwrap();
        let second = log.begin().unwrap();
        log.begin().unwrap();
        log.commit(first).unwrap();
        log.abort(second).unwrap();

        let bytes = fs::read(log.path()).unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 0, 0, 0, 0, 3, 1, 2, 0]);
    }

    #[test]
    fn test_reopen_preserves_state() {
        let temp_dir = tempdir().unwrap();
        let base = temp_dir.path().join("db");

        {
            let log = TransactionLog::create(&base).unwrap();
            let xid = log.begin().unwrap();
            log.commit(xid).unwrap();
            log.begin().unwrap();
            log.close().unwrap();
        }

        let log = TransactionLog::open(&base).unwrap();
        assert_eq!(log.last_xid(), Xid(2));
        assert!(log.is_committed(Xid(1)).unwrap());
        assert!(log.is_active(Xid(2)).unwrap());
        assert_eq!(log.begin().unwrap(), Xid(3));
    }

    #[test]
    fn test_create_existing_fails() {
        let temp_dir = tempdir().unwrap();
        let base = temp_dir.path().join("db");
        TransactionLog::create(&base).unwrap().close().unwrap();

        let err = TransactionLog::create(&base).unwrap_err();
        assert!(matches!(err, DbError::FileExists(ref p) if *p == xid_file_path(&base)));
    }

    #[test]
    fn test_debug_names_the_journal() {
        let temp_dir = tempdir().unwrap();
        let log = TransactionLog::create(temp_dir.path().join("db")).unwrap();

        let rendered = format!("{log:?}");
        assert!(rendered.starts_with("TransactionLog"));
        assert!(rendered.contains("db.xid"));
    }

    #[test]
    fn test_open_missing_fails() {
        let temp_dir = tempdir().unwrap();
        let err = TransactionLog::open(temp_dir.path().join("missing")).unwrap_err();
        assert!(matches!(err, DbError::FileNotExists(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_open_detects_length_mismatch() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("torn.xid");

        // Counter claims three transactions but only two slots made it to disk
        let mut bytes = codec::encode_u64(3).to_vec();
        bytes.extend_from_slice(&[1, 0]);
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            TransactionLog::open_at(&path),
            Err(DbError::BadXidFile(_))
        ));

        // A slot beyond the counter is just as bad
        let mut bytes = codec::encode_u64(1).to_vec();
        bytes.extend_from_slice(&[1, 0]);
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            TransactionLog::open_at(&path),
            Err(DbError::BadXidFile(_))
        ));
    }

    #[test]
    fn test_open_detects_short_header() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("short.xid");
        fs::write(&path, [0u8; 5]).unwrap();

        let err = TransactionLog::open_at(&path).unwrap_err();
        assert!(matches!(err, DbError::BadXidFile(_)));
        assert!(err.is_fatal());

        fs::write(&path, codec::encode_u64(u64::MAX)).unwrap();
        assert!(matches!(
            TransactionLog::open_at(&path),
            Err(DbError::BadXidFile(_))
        ));
    }

    #[test]
    fn test_unknown_status_byte() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("odd.xid");
        let mut bytes = codec::encode_u64(2).to_vec();
        bytes.extend_from_slice(&[1, 7]);
        fs::write(&path, &bytes).unwrap();

        let log = TransactionLog::open_at(&path).unwrap();
        assert!(log.is_committed(Xid(1)).unwrap());
        assert!(matches!(log.is_active(Xid(2)), Err(DbError::BadXidFile(_))));
        assert!(matches!(log.scan(), Err(DbError::BadXidFile(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_open_read_only_fails() {
        let temp_dir = tempdir().unwrap();
        let base = temp_dir.path().join("ro");
        TransactionLog::create(&base).unwrap().close().unwrap();

        let path = xid_file_path(&base);
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_readonly(true);
        fs::set_permissions(&path, perms).unwrap();

        assert!(matches!(
            TransactionLog::open(&base),
            Err(DbError::FileCannotReadWrite(_))
        ));
    }

    #[test]
    fn test_scan() {
        let temp_dir = tempdir().unwrap();
        let log = TransactionLog::create(temp_dir.path().join("db")).unwrap();
        assert!(log.scan().unwrap().is_empty());

        let a = log.begin().unwrap();
        let b = log.begin().unwrap();
        log.begin().unwrap();
        log.abort(a).unwrap();
        log.commit(b).unwrap();

        assert_eq!(
            log.scan().unwrap(),
            vec![
                (Xid(1), TransactionStatus::Aborted),
                (Xid(2), TransactionStatus::Committed),
                (Xid(3), TransactionStatus::Active),
            ]
        );
    }

    #[test]
    fn test_concurrent_begin_is_collision_free() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 25;

        let temp_dir = tempdir().unwrap();
        let log = TransactionLog::create(temp_dir.path().join("db")).unwrap();

        let xids: Vec<Xid> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    s.spawn(|| {
                        let mut issued = Vec::with_capacity(PER_THREAD);
                        for _ in 0..PER_THREAD {
                            let xid = log.begin().unwrap();
                            // Reads race with other threads' begins and finishes
                            assert!(log.is_active(xid).unwrap());
                            if xid.0 % 2 == 0 {
                                log.commit(xid).unwrap();
                            } else {
                                log.abort(xid).unwrap();
                            }
                            issued.push(xid);
                        }
                        issued
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect()
        });

        let total = (THREADS * PER_THREAD) as u64;
        let unique: HashSet<Xid> = xids.iter().copied().collect();
        assert_eq!(unique.len() as u64, total);
        assert_eq!(log.last_xid(), Xid(total));
        assert!(unique.iter().all(|xid| (1..=total).contains(&xid.0)));

        let len = fs::metadata(log.path()).unwrap().len();
        assert_eq!(len, XID_HEADER_LEN + total);

        for (xid, status) in log.scan().unwrap() {
            let expected = if xid.0 % 2 == 0 {
                TransactionStatus::Committed
            } else {
                TransactionStatus::Aborted
            };
            assert_eq!(status, expected);
        }
    }

    #[test]
    fn test_xid_file_path() {
        assert_eq!(xid_file_path("/data/main"), PathBuf::from("/data/main.xid"));
        assert_eq!(xid_file_path("rel/db.v1"), PathBuf::from("rel/db.v1.xid"));
    }
}
