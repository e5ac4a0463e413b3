//! Chunked upload coordination.
//!
//! A chunked file arrives as a sequence of requests that reuse one request
//! id. Every part goes through a [`ChunkProcessor`]; the coordinator enforces
//! ordering and size limits around it and answers `MegoChunkNext` or
//! `MegoChunkAbort` until the final part completes the file.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use mego_protocol::{Parts, RawFile, Request, Response, ResponseError, Status};
use tracing::{debug, warn};

use crate::error::HandlerError;
use crate::file::{File, split_name};
use crate::session::Session;

/// What a processor decided for one part.
#[derive(Debug)]
pub enum ChunkOutcome {
    /// Part stored, ask for the next one.
    Next,
    /// Stop the upload.
    Abort(Status),
    /// Final part stored, the file is complete.
    Done(File),
}

/// One part handed to a [`ChunkProcessor`].
#[derive(Debug)]
pub struct ChunkInput<'a> {
    pub session_id: &'a str,
    pub field: &'a str,
    pub raw: &'a RawFile,
    pub parts: Parts,
    pub upload_dir: &'a Path,
}

/// Stores the parts of a chunked upload.
///
/// `Done` is only legal for the final part and `Next` only for the others;
/// anything else is treated as an abort.
pub trait ChunkProcessor: Send + Sync {
    fn process(&self, input: &ChunkInput<'_>) -> ChunkOutcome;

    /// Called when an upload is abandoned before completion.
    fn discard(&self, _session_id: &str, _file_id: u64, _upload_dir: &Path) {}
}

impl<F> ChunkProcessor for F
where
    F: Fn(&ChunkInput<'_>) -> ChunkOutcome + Send + Sync,
{
    fn process(&self, input: &ChunkInput<'_>) -> ChunkOutcome {
        self(input)
    }
}

/// Default processor: appends parts to a file in the upload directory.
///
/// Parts go to `MEGO_CHUNK_<session>_<file id>`; the final part renames the
/// result to `<uuid>.<ext>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TempFileChunks;

impl TempFileChunks {
    fn partial_path(dir: &Path, session_id: &str, file_id: u64) -> PathBuf {
        dir.join(format!("MEGO_CHUNK_{session_id}_{file_id}"))
    }

    fn store(&self, input: &ChunkInput<'_>) -> io::Result<ChunkOutcome> {
        let path = Self::partial_path(input.upload_dir, input.session_id, input.raw.id);

        let mut options = OpenOptions::new();
        if input.parts.current == 1 {
            options.create(true).write(true).truncate(true);
        } else {
            options.create(true).append(true);
        }
        let mut partial = options.open(&path)?;
        partial.write_all(&input.raw.binary)?;
        drop(partial);

        if !input.parts.is_final() {
            return Ok(ChunkOutcome::Next);
        }

        let Some((name, extension)) = split_name(&input.raw.name) else {
            fs::remove_file(&path)?;
            return Ok(ChunkOutcome::Abort(Status::Invalid));
        };
        let size = fs::metadata(&path)?.len();
        let target = input
            .upload_dir
            .join(format!("{}.{extension}", uuid::Uuid::new_v4()));
        fs::rename(&path, &target)?;

        Ok(ChunkOutcome::Done(File {
            name,
            extension,
            path: target,
            size,
            metadata: Default::default(),
        }))
    }
}

impl ChunkProcessor for TempFileChunks {
    fn process(&self, input: &ChunkInput<'_>) -> ChunkOutcome {
        match self.store(input) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    session = %input.session_id,
                    file_id = input.raw.id,
                    error = %e,
                    "Failed to store chunk"
                );
                ChunkOutcome::Abort(Status::Error)
            }
        }
    }

    fn discard(&self, session_id: &str, file_id: u64, upload_dir: &Path) {
        let path = Self::partial_path(upload_dir, session_id, file_id);
        match fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "Removed partial upload"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove partial upload"),
        }
    }
}

/// Upload in progress for one (session, request id).
pub(crate) struct PendingUpload {
    pub(crate) file_id: u64,
    total: u64,
    next_part: u64,
    received: usize,
    params: Bytes,
    upload_dir: PathBuf,
    processor: Arc<dyn ChunkProcessor>,
    touched: Instant,
}

impl PendingUpload {
    fn accepts(&self, raw: &RawFile, parts: Parts) -> bool {
        raw.id == self.file_id && parts.total == self.total && parts.current == self.next_part
    }

    /// Time since the last accepted part.
    pub(crate) fn idle_for(&self) -> Duration {
        self.touched.elapsed()
    }

    pub(crate) fn discard(&self, session_id: &str) {
        self.processor
            .discard(session_id, self.file_id, &self.upload_dir);
    }
}

/// Size limits applied to one method's uploads.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Limits {
    pub max_chunk_size: usize,
    pub max_file_size: usize,
}

/// How the files of a request must be handled.
#[derive(Debug)]
pub(crate) enum Upload<'a> {
    /// No files, or only whole ones.
    Whole,
    /// Exactly one chunked file and nothing else.
    Chunk { field: &'a str, raw: &'a RawFile },
}

/// Rejects requests mixing chunked and whole files, or carrying several chunked files.
pub(crate) fn classify(request: &Request) -> Result<Upload<'_>, HandlerError> {
    let mut chunk = None;
    let mut whole = 0usize;
    for (field, raw) in request.raw_files() {
        if raw.is_chunk() {
            if chunk.is_some() {
                return Err(HandlerError::new(
                    Status::Invalid,
                    "only one chunked file per request",
                ));
            }
            chunk = Some((field, raw));
        } else {
            whole += 1;
        }
    }

    match chunk {
        Some(_) if whole > 0 => Err(HandlerError::new(
            Status::Invalid,
            "chunked and whole files cannot be mixed",
        )),
        Some((field, raw)) => Ok(Upload::Chunk { field, raw }),
        None => Ok(Upload::Whole),
    }
}

/// Result of feeding one part to the coordinator.
#[derive(Debug)]
pub(crate) enum ChunkStep {
    /// Dispatch ends with this push (`MegoChunkNext` or `MegoChunkAbort`).
    Reply(Response),
    /// Final part accepted; run the chain with the first frame's params.
    Complete {
        params: Bytes,
        field: String,
        file: File,
    },
}

/// Feeds one part of a chunked upload.
pub(crate) fn advance(
    session: &Session,
    request: &Request,
    field: &str,
    raw: &RawFile,
    limits: Limits,
    processor: Arc<dyn ChunkProcessor>,
    upload_dir: &Path,
) -> ChunkStep {
    let id = request.id;
    let previous = session.uploads.lock().remove(&id);

    let parts = match raw.parts() {
        Ok(Some(parts)) => parts,
        _ => return abort(session, id, previous, Status::Invalid, "malformed parts"),
    };

    let mut upload = match previous {
        Some(prev) if parts.current == 1 => {
            prev.discard(session.id());
            None
        }
        Some(prev) if prev.accepts(raw, parts) => Some(prev),
        Some(prev) => {
            return abort(session, id, Some(prev), Status::Invalid, "part out of sequence");
        }
        None if parts.current == 1 => None,
        None => return abort(session, id, None, Status::Invalid, "upload not started"),
    }
    .unwrap_or_else(|| PendingUpload {
        file_id: raw.id,
        total: parts.total,
        next_part: 1,
        received: 0,
        params: request.params.clone(),
        upload_dir: upload_dir.to_path_buf(),
        processor,
        touched: Instant::now(),
    });

    if raw.binary.is_empty() {
        return abort(session, id, Some(upload), Status::FileEmpty, "empty chunk");
    }
    if raw.binary.len() > limits.max_chunk_size {
        return abort(session, id, Some(upload), Status::FileTooLarge, "chunk too large");
    }
    upload.received += raw.binary.len();
    if upload.received > limits.max_file_size {
        return abort(session, id, Some(upload), Status::FileTooLarge, "file too large");
    }

    let input = ChunkInput {
        session_id: session.id(),
        field,
        raw,
        parts,
        upload_dir: &upload.upload_dir,
    };
    let outcome = match (upload.processor.process(&input), parts.is_final()) {
        (ChunkOutcome::Next, false) => ChunkOutcome::Next,
        (ChunkOutcome::Done(file), true) => ChunkOutcome::Done(file),
        (ChunkOutcome::Abort(status), _) => ChunkOutcome::Abort(status),
        (outcome, is_final) => {
            warn!(?outcome, is_final, file_id = raw.id, "Chunk processor returned an illegal outcome");
            ChunkOutcome::Abort(Status::Error)
        }
    };

    match outcome {
        ChunkOutcome::Next => {
            debug!(session = %session.id(), id, part = parts.current, total = parts.total, "Chunk accepted");
            upload.next_part += 1;
            upload.touched = Instant::now();
            session.uploads.lock().insert(id, upload);
            ChunkStep::Reply(Response::chunk_next(id))
        }
        ChunkOutcome::Abort(status) => abort(session, id, Some(upload), status, "processor aborted"),
        ChunkOutcome::Done(file) => {
            debug!(session = %session.id(), id, size = file.size, "Chunked upload complete");
            ChunkStep::Complete {
                params: upload.params,
                field: field.to_string(),
                file,
            }
        }
    }
}

fn abort(
    session: &Session,
    id: u64,
    pending: Option<PendingUpload>,
    status: Status,
    reason: &str,
) -> ChunkStep {
    debug!(session = %session.id(), id, %status, reason, "Chunked upload aborted");
    if let Some(upload) = pending {
        upload.discard(session.id());
    }
    ChunkStep::Reply(Response::chunk_abort(
        id,
        ResponseError::new(status, reason, Bytes::new()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const LIMITS: Limits = Limits {
        max_chunk_size: 8,
        max_file_size: 20,
    };

    fn session() -> Session {
        Session::new("s1".into(), 4).0
    }

    fn part(current: u64, total: u64, data: &'static [u8]) -> Request {
        let mut request = Request::call("Upload", Bytes::from_static(b"\x91\x01"), 5);
        request.files.insert(
            "File1".into(),
            vec![RawFile::chunk(Bytes::from_static(data), 9, total, current, "notes.txt")],
        );
        request
    }

    fn feed(session: &Session, request: &Request, dir: &Path) -> ChunkStep {
        let Upload::Chunk { field, raw } = classify(request).unwrap() else {
            panic!("not a chunk request");
        };
        advance(session, request, field, raw, LIMITS, Arc::new(TempFileChunks), dir)
    }

    fn assert_next(step: ChunkStep) {
        match step {
            ChunkStep::Reply(r) => assert!(r.is_chunk_next(), "expected next, got {r:?}"),
            other => panic!("expected next, got {other:?}"),
        }
    }

    fn assert_abort(step: ChunkStep, status: Status) {
        match step {
            ChunkStep::Reply(r) => {
                assert!(r.is_chunk_abort());
                assert_eq!(r.error.unwrap().status(), Some(status));
            }
            other => panic!("expected abort, got {other:?}"),
        }
    }

    #[test]
    fn three_parts_assemble_one_file() {
        let dir = tempdir().unwrap();
        let session = session();

        assert_next(feed(&session, &part(1, 3, b"abc"), dir.path()));
        assert_next(feed(&session, &part(2, 3, b"defg"), dir.path()));
        let mut last = part(3, 3, b"hi");
        last.params = Bytes::new();

        match feed(&session, &last, dir.path()) {
            ChunkStep::Complete { params, field, file } => {
                assert_eq!(params.as_ref(), b"\x91\x01");
                assert_eq!(field, "File1");
                assert_eq!(file.size, 9);
                assert_eq!(file.name, "notes");
                assert_eq!(file.extension, "txt");
                assert_eq!(fs::read(&file.path).unwrap(), b"abcdefghi");
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert!(session.uploads.lock().is_empty());
        assert!(!dir.path().join("MEGO_CHUNK_s1_9").exists());
    }

    #[test]
    fn single_part_upload_completes_immediately() {
        let dir = tempdir().unwrap();
        let step = feed(&session(), &part(1, 1, b"x"), dir.path());
        assert!(matches!(step, ChunkStep::Complete { .. }));
    }

    #[test]
    fn skipped_part_aborts_and_discards() {
        let dir = tempdir().unwrap();
        let session = session();
        assert_next(feed(&session, &part(1, 3, b"abc"), dir.path()));
        assert!(dir.path().join("MEGO_CHUNK_s1_9").exists());

        assert_abort(feed(&session, &part(3, 3, b"x"), dir.path()), Status::Invalid);
        assert!(!dir.path().join("MEGO_CHUNK_s1_9").exists());
        assert!(session.uploads.lock().is_empty());
    }

    #[test]
    fn stale_uploads_are_swept() {
        let dir = tempdir().unwrap();
        let session = session();
        for id in 1..=10 {
            let mut request = part(1, 3, b"abc");
            request.id = id;
            request.files.get_mut("File1").unwrap()[0].id = 100 + id;
            assert_next(feed(&session, &request, dir.path()));
        }
        assert_eq!(session.uploads.lock().len(), 10);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 10);

        assert_eq!(session.sweep_uploads(Duration::from_secs(60)), 0);
        assert_eq!(session.sweep_uploads(Duration::ZERO), 10);
        assert!(session.uploads.lock().is_empty());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn upload_must_start_at_part_one() {
        let dir = tempdir().unwrap();
        assert_abort(feed(&session(), &part(2, 3, b"abc"), dir.path()), Status::Invalid);
    }

    #[test]
    fn size_limits() {
        let dir = tempdir().unwrap();
        let session = session();
        assert_abort(
            feed(&session, &part(1, 2, b"123456789"), dir.path()),
            Status::FileTooLarge,
        );

        assert_next(feed(&session, &part(1, 4, b"12345678"), dir.path()));
        assert_next(feed(&session, &part(2, 4, b"12345678"), dir.path()));
        assert_abort(
            feed(&session, &part(3, 4, b"12345678"), dir.path()),
            Status::FileTooLarge,
        );
    }

    #[test]
    fn empty_chunk_aborts() {
        let dir = tempdir().unwrap();
        assert_abort(feed(&session(), &part(1, 2, b""), dir.path()), Status::FileEmpty);
    }

    #[test]
    fn illegal_processor_outcome_aborts() {
        let dir = tempdir().unwrap();
        let session = session();
        let request = part(1, 3, b"abc");
        let Upload::Chunk { field, raw } = classify(&request).unwrap() else {
            panic!("not a chunk request");
        };

        fn early_done(input: &ChunkInput<'_>) -> ChunkOutcome {
            ChunkOutcome::Done(File::new(&input.raw.name, PathBuf::from("/dev/null"), 0).unwrap())
        }
        let step = advance(&session, &request, field, raw, LIMITS, Arc::new(early_done), dir.path());
        assert_abort(step, Status::Error);
    }

    #[test]
    fn missing_extension_aborts_on_final_part() {
        let dir = tempdir().unwrap();
        let mut request = part(1, 1, b"abc");
        request.files.get_mut("File1").unwrap()[0].name = "README".into();
        assert_abort(feed(&session(), &request, dir.path()), Status::Invalid);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn classify_rejects_mixing() {
        let mut request = part(1, 2, b"abc");
        request.files.insert(
            "File2".into(),
            vec![RawFile::whole(Bytes::from_static(b"x"), 2, "a.txt")],
        );
        assert_eq!(classify(&request).unwrap_err().status(), Status::Invalid);

        let mut request = part(1, 2, b"abc");
        request.files.get_mut("File1").unwrap().push(RawFile::chunk(
            Bytes::from_static(b"y"),
            3,
            2,
            1,
            "b.txt",
        ));
        assert!(classify(&request).is_err());

        let whole_only = Request::call("Upload", Bytes::new(), 1);
        assert!(matches!(classify(&whole_only).unwrap(), Upload::Whole));
    }
}
