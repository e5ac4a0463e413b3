//! Per-dispatch context and the handler chain state machine.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use mego_protocol::{Response, ResponseError, Status, decode_value, encode_value};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::error::{HandlerError, HandlerResult, ServerResult};
use crate::file::File;
use crate::hub::Hub;
use crate::method::Handler;
use crate::params::Params;
use crate::session::Session;

/// Position of a dispatch in its handler chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    /// No handler has run yet.
    Init,
    /// Handler `i` is running.
    Running(usize),
    /// Stopped by an abort; nothing else runs.
    Aborted,
    /// Every handler ran.
    Completed,
}

impl ChainState {
    /// Returns true for `Aborted` and `Completed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Aborted | Self::Completed)
    }
}

/// One in-flight request.
pub struct Context {
    session: Arc<Session>,
    hub: Hub,
    method: String,
    id: u64,
    raw_params: Bytes,
    params: Option<Params>,
    files: HashMap<String, Vec<File>>,
    keys: HashMap<String, Value>,
    errors: Vec<HandlerError>,
    chain: Vec<Handler>,
    state: ChainState,
    responded: bool,
}

impl Context {
    pub(crate) fn new(
        session: Arc<Session>,
        hub: Hub,
        method: impl Into<String>,
        id: u64,
        raw_params: Bytes,
        chain: Vec<Handler>,
    ) -> Self {
        Self {
            session,
            hub,
            method: method.into(),
            id,
            raw_params,
            params: None,
            files: HashMap::new(),
            keys: HashMap::new(),
            errors: Vec::new(),
            chain,
            state: ChainState::Init,
            responded: false,
        }
    }

    /// The calling session.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// The engine's registries, for broadcasting to other sessions.
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Method name as sent by the client.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Request id, `0` for fire-and-forget calls.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ChainState {
        self.state
    }

    pub fn is_aborted(&self) -> bool {
        self.state == ChainState::Aborted
    }

    /// Returns true once any reply frame was sent for this request.
    pub fn has_responded(&self) -> bool {
        self.responded
    }

    /// Runs the remaining handlers.
    ///
    /// A middleware calling `next` resumes once the rest of the chain is done.
    /// A handler error aborts the chain and replies with the error's status.
    pub fn next(&mut self) {
        loop {
            let index = match self.state {
                ChainState::Init => 0,
                ChainState::Running(i) => i + 1,
                ChainState::Aborted | ChainState::Completed => return,
            };
            let Some(handler) = self.chain.get(index).cloned() else {
                self.state = ChainState::Completed;
                return;
            };

            self.state = ChainState::Running(index);
            if let Err(e) = handler(self) {
                self.fail(e);
                return;
            }
        }
    }

    /// Stops the chain without replying.
    pub fn abort(&mut self) {
        self.state = ChainState::Aborted;
    }

    /// Stops the chain and replies with `status`.
    ///
    /// Error statuses are sent as an error frame, the others as an empty result.
    pub fn abort_with_status(&mut self, status: Status) {
        self.abort();
        if status.is_error() {
            self.send(Response::error(self.id, ResponseError::from_status(status)));
        } else {
            self.send(Response::result(self.id, Bytes::new()));
        }
    }

    /// Stops the chain and replies with `result`.
    pub fn abort_with_respond<T: Serialize + ?Sized>(&mut self, result: &T) -> HandlerResult {
        self.abort();
        self.respond(result)
    }

    /// Stops the chain and replies with an error.
    pub fn abort_with_error<T: Serialize + ?Sized>(
        &mut self,
        status: Status,
        data: &T,
        message: impl Into<String>,
    ) -> HandlerResult {
        self.abort();
        self.respond_with_error(status, data, message)
    }

    /// Replies with `result` without stopping the chain. May be called more than once.
    pub fn respond<T: Serialize + ?Sized>(&mut self, result: &T) -> HandlerResult {
        if self.id == 0 {
            return Ok(());
        }
        let result = encode_value(result)?;
        self.send(Response::result(self.id, result));
        Ok(())
    }

    /// Replies with an error without stopping the chain.
    pub fn respond_with_error<T: Serialize + ?Sized>(
        &mut self,
        status: Status,
        data: &T,
        message: impl Into<String>,
    ) -> HandlerResult {
        if self.id == 0 {
            return Ok(());
        }
        let data = encode_value(data)?;
        self.send(Response::error(
            self.id,
            ResponseError::new(status, message, data),
        ));
        Ok(())
    }

    /// Pushes `event` to the calling session only.
    pub fn emit<T: Serialize + ?Sized>(&self, event: &str, payload: &T) -> HandlerResult {
        let response = Response::push(event, encode_value(payload)?);
        if !self.session.push(&response) {
            debug!(session = %self.session.id(), event, "Event push dropped");
        }
        Ok(())
    }

    /// Pushes `event` to every subscriber of `channel` except the caller.
    pub fn emit_others<T: Serialize + ?Sized>(
        &self,
        event: &str,
        channel: &str,
        payload: &T,
    ) -> ServerResult<usize> {
        let me = self.session.id();
        self.hub
            .emit_filter(event, channel, payload, |s| s.id() != me)
    }

    /// Decodes the whole params payload into `T`.
    pub fn bind<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        decode_value(&self.raw_params).map_err(HandlerError::Bind)
    }

    /// Positional params, decoded on first access.
    ///
    /// Values go through JSON-compatible [`Value`]s, so a payload holding
    /// `bin` data or maps with non-string keys fails with
    /// [`HandlerError::Bind`]. Use [`bind`](Self::bind) for those.
    pub fn params(&mut self) -> Result<&Params, HandlerError> {
        if self.params.is_none() {
            let value: Value = decode_value(&self.raw_params).map_err(HandlerError::Bind)?;
            self.params = Some(Params::from_value(value));
        }
        Ok(self.params.get_or_insert_with(Params::default))
    }

    /// Undecoded params payload.
    pub fn raw_params(&self) -> &Bytes {
        &self.raw_params
    }

    /// First file of `field`.
    pub fn file(&self, field: &str) -> Result<&File, HandlerError> {
        self.files(field)?
            .first()
            .ok_or_else(|| HandlerError::missing_file(field))
    }

    /// Every file of `field`.
    pub fn files(&self, field: &str) -> Result<&[File], HandlerError> {
        self.files
            .get(field)
            .filter(|files| !files.is_empty())
            .map(Vec::as_slice)
            .ok_or_else(|| HandlerError::missing_file(field))
    }

    /// Mutable access to the files of `field`, for moving or renaming them.
    pub fn files_mut(&mut self, field: &str) -> Result<&mut Vec<File>, HandlerError> {
        self.files
            .get_mut(field)
            .ok_or_else(|| HandlerError::missing_file(field))
    }

    /// Every uploaded file, by field.
    pub fn all_files(&self) -> &HashMap<String, Vec<File>> {
        &self.files
    }

    pub(crate) fn attach_file(&mut self, field: impl Into<String>, file: File) {
        self.files.entry(field.into()).or_default().push(file);
    }

    /// Stores a key for the rest of this dispatch.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.keys.insert(key.into(), value.into());
    }

    /// Reads a key stored by an earlier handler.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.keys.get(key)
    }

    /// Records an error without stopping the chain.
    pub fn error(&mut self, err: HandlerError) -> &mut Self {
        self.errors.push(err);
        self
    }

    /// Errors recorded so far, including the one that aborted the chain.
    pub fn errors(&self) -> &[HandlerError] {
        &self.errors
    }

    /// Aborts with an error reply built from `err`.
    pub(crate) fn fail(&mut self, err: HandlerError) {
        let status = err.status();
        let message = err.to_string();
        debug!(method = %self.method, id = self.id, %status, error = %message, "Handler failed");
        self.errors.push(err);
        self.abort();
        if self.id != 0 {
            self.send(Response::error(
                self.id,
                ResponseError::new(status, message, Bytes::new()),
            ));
        }
    }

    /// Sends an empty result when a call completed without replying.
    pub(crate) fn finish(&mut self) {
        if self.state == ChainState::Completed && !self.responded && self.id != 0 {
            self.send(Response::result(self.id, Bytes::new()));
        }
    }

    fn send(&mut self, response: Response) {
        if response.id == 0 {
            return;
        }
        self.responded = true;
        self.session.send(&response);
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("session", &self.session.id())
            .field("method", &self.method)
            .field("id", &self.id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::handler;
    use mego_protocol::decode_message;
    use crate::session::Outbox;
    use parking_lot::Mutex;

    fn context(id: u64, params: Bytes, chain: Vec<Handler>) -> (Context, Outbox) {
        let hub = Hub::new(4);
        let (session, rx) = hub.create_session(16).unwrap();
        (Context::new(session, hub, "Test", id, params, chain), rx)
    }

    fn replies(rx: &mut Outbox) -> Vec<Response> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(decode_message(&frame).unwrap());
        }
        out
    }

    fn trace_handler(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> Handler {
        let log = log.clone();
        handler(move |_| {
            log.lock().push(name);
            Ok(())
        })
    }

    #[test]
    fn runs_every_handler_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = vec![trace_handler(&log, "a"), trace_handler(&log, "b"), trace_handler(&log, "c")];
        let (mut ctx, _rx) = context(1, Bytes::new(), chain);

        ctx.next();
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
        assert_eq!(ctx.state(), ChainState::Completed);
    }

    #[test]
    fn middleware_wraps_the_rest() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let wrap_log = log.clone();
        let wrapper = handler(move |ctx| {
            wrap_log.lock().push("before");
            ctx.next();
            wrap_log.lock().push("after");
            Ok(())
        });
        let chain = vec![wrapper, trace_handler(&log, "inner")];
        let (mut ctx, _rx) = context(1, Bytes::new(), chain);

        ctx.next();
        assert_eq!(*log.lock(), vec!["before", "inner", "after"]);
        assert_eq!(ctx.state(), ChainState::Completed);
    }

    #[test]
    fn abort_stops_later_handlers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = vec![
            trace_handler(&log, "a"),
            handler(|ctx| {
                ctx.abort_with_status(Status::NotAuthorized);
                Ok(())
            }),
            trace_handler(&log, "c"),
        ];
        let (mut ctx, mut rx) = context(3, Bytes::new(), chain);

        ctx.next();
        ctx.finish();
        assert_eq!(*log.lock(), vec!["a"]);
        assert!(ctx.is_aborted());

        let replies = replies(&mut rx);
        assert_eq!(replies.len(), 1);
        assert_eq!(
            replies[0].error.as_ref().unwrap().status(),
            Some(Status::NotAuthorized)
        );
    }

    #[test]
    fn handler_error_becomes_error_reply() {
        let chain = vec![handler(|_| Err(HandlerError::new(Status::NotFound, "no such room")))];
        let (mut ctx, mut rx) = context(8, Bytes::new(), chain);

        ctx.next();
        let replies = replies(&mut rx);
        assert_eq!(replies.len(), 1);
        let error = replies[0].error.as_ref().unwrap();
        assert_eq!(error.status(), Some(Status::NotFound));
        assert_eq!(error.message, "no such room");
        assert_eq!(ctx.errors().len(), 1);
    }

    #[test]
    fn respond_may_repeat() {
        let chain = vec![handler(|ctx| {
            ctx.respond(&"working")?;
            ctx.respond(&"done")
        })];
        let (mut ctx, mut rx) = context(2, Bytes::new(), chain);

        ctx.next();
        ctx.finish();
        let replies = replies(&mut rx);
        assert_eq!(replies.len(), 2);
        assert!(replies.iter().all(|r| r.id == 2));
    }

    #[test]
    fn notifications_get_no_reply() {
        let chain = vec![handler(|ctx| {
            ctx.respond(&1)?;
            Err(HandlerError::from(Status::Error))
        })];
        let (mut ctx, mut rx) = context(0, Bytes::new(), chain);

        ctx.next();
        ctx.finish();
        assert!(replies(&mut rx).is_empty());
    }

    #[test]
    fn silent_completion_gets_empty_result() {
        let (mut ctx, mut rx) = context(4, Bytes::new(), vec![handler(|_| Ok(()))]);
        ctx.next();
        ctx.finish();

        let replies = replies(&mut rx);
        assert_eq!(replies.len(), 1);
        assert!(replies[0].error.is_none());
        assert!(replies[0].result.is_empty());
    }

    #[test]
    fn params_and_bind() {
        let params = encode_value(&(3, 4)).unwrap();
        let (mut ctx, _rx) = context(1, params, Vec::new());

        let (a, b): (i64, i64) = ctx.bind().unwrap();
        assert_eq!(a + b, 7);
        assert_eq!(ctx.params().unwrap().get(1).get_i64(), 4);
        assert_eq!(ctx.params().unwrap().get(5).get_i64(), 0);
        assert!(ctx.bind::<String>().is_err());
    }

    #[test]
    fn binary_params_only_bind() {
        let params = encode_value(&(7u8, Bytes::from_static(b"\x00\x01"))).unwrap();
        let (mut ctx, _rx) = context(1, params, Vec::new());

        assert!(matches!(ctx.params(), Err(HandlerError::Bind(_))));
        let (n, blob): (u8, Bytes) = ctx.bind().unwrap();
        assert_eq!(n, 7);
        assert_eq!(blob.as_ref(), b"\x00\x01");
    }

    #[test]
    fn keys_and_missing_files() {
        let (mut ctx, _rx) = context(1, Bytes::new(), Vec::new());
        ctx.set("user", "yami");
        assert_eq!(ctx.get("user"), Some(&Value::from("yami")));
        assert!(matches!(
            ctx.file("File1"),
            Err(HandlerError::MissingFile { .. })
        ));
    }

    #[test]
    fn emit_targets_own_session() {
        let (ctx, mut rx) = context(0, Bytes::new(), Vec::new());
        ctx.emit("Welcome", "hi").unwrap();

        let replies = replies(&mut rx);
        assert_eq!(replies[0].event, "Welcome");
        assert!(replies[0].is_unsolicited());
    }
}
