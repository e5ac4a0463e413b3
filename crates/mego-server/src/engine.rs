//! Method registry and request dispatch.
//!
//! The engine is configured mutably, then wrapped in an `Arc` and shared by
//! every connection; the method table does not change after that.

use std::collections::HashMap;
use std::fs;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use bytes::Bytes;
use mego_protocol::{
    Request, Response, ResponseError, SUBSCRIBE_METHOD, Status, UNSUBSCRIBE_METHOD,
    decode_message, decode_value, encode_value, is_reserved_method,
};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::chunk::{ChunkProcessor, ChunkStep, Limits, TempFileChunks, Upload, advance, classify};
use crate::config::EngineConfig;
use crate::context::Context;
use crate::error::{HandlerError, HandlerResult, ServerError, ServerResult};
use crate::file::{File, persist_whole};
use crate::hub::Hub;
use crate::method::{Handler, Method, handler};
use crate::middleware::{logger, panic_message, recovery};
use crate::session::Session;

/// Decides whether a session may join `event`/`channel`.
pub type SubscribeAuthorizer = Arc<dyn Fn(&str, &str, &Context) -> bool + Send + Sync>;

/// The RPC engine: registered methods, middleware and the shared [`Hub`].
pub struct Engine {
    config: EngineConfig,
    hub: Hub,
    methods: HashMap<String, Method>,
    middleware: Vec<Handler>,
    no_method: Option<Handler>,
    authorizer: Option<SubscribeAuthorizer>,
    chunk_processor: Arc<dyn ChunkProcessor>,
}

impl Engine {
    /// Creates an engine without middleware.
    pub fn new(config: EngineConfig) -> Self {
        let hub = Hub::new(config.max_sessions);
        Self {
            config,
            hub,
            methods: HashMap::new(),
            middleware: Vec::new(),
            no_method: None,
            authorizer: None,
            chunk_processor: Arc::new(TempFileChunks),
        }
    }

    /// Creates an engine with the `recovery` and `logger` middleware installed.
    pub fn with_defaults(config: EngineConfig) -> Self {
        let mut engine = Self::new(config);
        engine.use_middleware(recovery()).use_middleware(logger());
        engine
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Session and subscription registries.
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Registers a method. Names are matched case-insensitively.
    pub fn register<F>(&mut self, name: &str, f: F) -> ServerResult<&mut Method>
    where
        F: Fn(&mut Context) -> HandlerResult + Send + Sync + 'static,
    {
        if is_reserved_method(name) {
            return Err(ServerError::ReservedMethod {
                name: name.to_string(),
            });
        }
        let key = name.to_ascii_uppercase();
        if self.methods.contains_key(&key) {
            return Err(ServerError::DuplicateMethod {
                name: name.to_string(),
            });
        }

        debug!(method = name, "Registered method");
        Ok(self
            .methods
            .entry(key)
            .or_insert_with(|| Method::new(name.to_string(), Arc::new(f))))
    }

    /// Looks up a registered method.
    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.get(&name.to_ascii_uppercase())
    }

    /// Appends global middleware, run before every method's own chain.
    pub fn use_middleware(&mut self, middleware: Handler) -> &mut Self {
        self.middleware.push(middleware);
        self
    }

    /// Handler for unknown methods, run after global middleware.
    pub fn no_method<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&mut Context) -> HandlerResult + Send + Sync + 'static,
    {
        self.no_method = Some(handler(f));
        self
    }

    /// Gates subscribe requests.
    pub fn handle_subscribe<F>(&mut self, authorizer: F) -> &mut Self
    where
        F: Fn(&str, &str, &Context) -> bool + Send + Sync + 'static,
    {
        self.authorizer = Some(Arc::new(authorizer));
        self
    }

    /// Replaces the default chunk processor.
    pub fn handle_chunk<P: ChunkProcessor + 'static>(&mut self, processor: P) -> &mut Self {
        self.chunk_processor = Arc::new(processor);
        self
    }

    /// Broadcasts to a channel, see [`Hub::emit`].
    pub fn emit<T: Serialize + ?Sized>(
        &self,
        event: &str,
        channel: &str,
        payload: &T,
    ) -> ServerResult<usize> {
        self.hub.emit(event, channel, payload)
    }

    /// Handles one inbound frame of `session`.
    ///
    /// Malformed frames are dropped. Panics escaping the chain are logged and
    /// answered with `Status::Error` unless the request was already answered.
    #[tracing::instrument(skip_all, fields(session = %session.id()))]
    pub fn dispatch(&self, session: &Arc<Session>, frame: &[u8]) {
        session.mark_alive();

        let request: Request = match decode_message(frame) {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, len = frame.len(), "Dropping malformed frame");
                return;
            }
        };

        let id = request.id;
        let method = request.method.clone();
        session.clear_last_reply();
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| self.route(session, request))) {
            error!(
                method = %method,
                id,
                panic = %panic_message(payload.as_ref()),
                "Dispatch panicked"
            );
            if id != 0 && session.last_reply() != id {
                session.send(&Response::error(
                    id,
                    ResponseError::new(Status::Error, "panic recovered", Bytes::new()),
                ));
            }
        }
    }

    fn route(&self, session: &Arc<Session>, request: Request) {
        if request.is_init() {
            return self.init(session, &request);
        }
        if request.method.eq_ignore_ascii_case(SUBSCRIBE_METHOD) {
            return self.subscribe(session, &request);
        }
        if request.method.eq_ignore_ascii_case(UNSUBSCRIBE_METHOD) {
            return self.unsubscribe(session, &request);
        }

        match self.methods.get(&request.method.to_ascii_uppercase()) {
            Some(method) => self.call(session, method, request),
            None => match &self.no_method {
                Some(fallback) => {
                    let mut chain = self.middleware.clone();
                    chain.push(fallback.clone());
                    let mut ctx = self.context(session, &request, request.params.clone(), chain);
                    ctx.next();
                    ctx.finish();
                }
                None => debug!(method = %request.method, "Dropping call to unknown method"),
            },
        }
    }

    fn context(
        &self,
        session: &Arc<Session>,
        request: &Request,
        params: Bytes,
        chain: Vec<Handler>,
    ) -> Context {
        Context::new(
            session.clone(),
            self.hub.clone(),
            request.method.clone(),
            request.id,
            params,
            chain,
        )
    }

    /// Merges the init frame's keys into the session.
    fn init(&self, session: &Arc<Session>, request: &Request) {
        match decode_value::<Option<HashMap<String, Value>>>(&request.params) {
            Ok(keys) => {
                let keys = keys.unwrap_or_default();
                debug!(keys = keys.len(), "Session initialised");
                session.merge_keys(keys);
                if request.id != 0 {
                    reply(session, request.id, session.id());
                }
            }
            Err(e) => {
                debug!(error = %e, "Invalid init frame");
                reply_error(session, request.id, Status::Invalid, "init params must be a map");
            }
        }
    }

    fn subscribe(&self, session: &Arc<Session>, request: &Request) {
        let Some((event, channel)) = event_pair(request) else {
            return reply_error(session, request.id, Status::Invalid, "missing event and channel");
        };

        if let Some(authorizer) = &self.authorizer {
            let ctx = self.context(session, request, request.params.clone(), Vec::new());
            if !authorizer(&event, &channel, &ctx) {
                debug!(event, channel, "Subscription refused");
                return reply_error(session, request.id, Status::NoPermission, "subscription refused");
            }
        }

        match self.hub.subscribe(session, &event, &channel) {
            Ok(_) => {
                if request.id != 0 {
                    reply(session, request.id, &());
                }
            }
            Err(e) => debug!(error = %e, "Subscribe ignored"),
        }
    }

    fn unsubscribe(&self, session: &Arc<Session>, request: &Request) {
        let Some((event, channel)) = event_pair(request) else {
            return reply_error(session, request.id, Status::Invalid, "missing event and channel");
        };
        self.hub.unsubscribe(session, &event, &channel);
        if request.id != 0 {
            reply(session, request.id, &());
        }
    }

    fn call(&self, session: &Arc<Session>, method: &Method, request: Request) {
        let options = method.method_options();
        let limits = Limits {
            max_chunk_size: options.max_chunk_size.unwrap_or(self.config.max_chunk_size),
            max_file_size: options.max_file_size.unwrap_or(self.config.max_file_size),
        };
        let max_size = options.max_size.unwrap_or(self.config.max_payload_size);
        let chain = method.chain(&self.middleware);

        let upload = match classify(&request) {
            Ok(upload) => upload,
            Err(e) => return self.context(session, &request, Bytes::new(), chain).fail(e),
        };

        let size = match &upload {
            Upload::Whole => request.params.len() + request.file_bytes(),
            Upload::Chunk { .. } => request.params.len(),
        };
        if size > max_size {
            debug!(method = %request.method, size, max_size, "Request too large");
            let err = HandlerError::new(
                Status::FileTooLarge,
                format!("request carries {size} bytes (max: {max_size})"),
            );
            return self.context(session, &request, Bytes::new(), chain).fail(err);
        }

        let mut ctx = match upload {
            Upload::Chunk { field, raw } => {
                if request.id == 0 {
                    debug!(method = %request.method, "Dropping chunk without request id");
                    return;
                }
                session.sweep_uploads(self.config.upload_timeout());
                let processor = method
                    .processor()
                    .unwrap_or_else(|| self.chunk_processor.clone());
                match advance(
                    session,
                    &request,
                    field,
                    raw,
                    limits,
                    processor,
                    &self.config.upload_dir,
                ) {
                    ChunkStep::Reply(response) => {
                        session.send(&response);
                        return;
                    }
                    ChunkStep::Complete {
                        params,
                        field,
                        file,
                    } => {
                        let mut ctx = self.context(session, &request, params, chain);
                        ctx.attach_file(field, file);
                        ctx
                    }
                }
            }
            Upload::Whole => {
                let mut ctx = self.context(session, &request, request.params.clone(), chain);
                if let Err(e) = self.persist_files(&mut ctx, &request, limits) {
                    return ctx.fail(e);
                }
                ctx
            }
        };

        ctx.next();
        ctx.finish();
    }

    fn persist_files(
        &self,
        ctx: &mut Context,
        request: &Request,
        limits: Limits,
    ) -> HandlerResult {
        let mut stored: Vec<(&str, File)> = Vec::new();
        for (field, raw) in request.raw_files() {
            match persist_whole(raw, &self.config.upload_dir, limits.max_file_size) {
                Ok(file) => stored.push((field, file)),
                Err(e) => {
                    for (_, file) in &stored {
                        if let Err(e) = fs::remove_file(&file.path) {
                            warn!(path = %file.path.display(), error = %e, "Failed to remove upload");
                        }
                    }
                    return Err(e);
                }
            }
        }
        for (field, file) in stored {
            ctx.attach_file(field, file);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut methods: Vec<_> = self.methods.values().map(Method::name).collect();
        methods.sort_unstable();
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("methods", &methods)
            .field("middleware", &self.middleware.len())
            .finish_non_exhaustive()
    }
}

/// `(event, channel)` from the `e` field, or from the first two params.
fn event_pair(request: &Request) -> Option<(String, String)> {
    if let Some(pair) = &request.event {
        return Some(pair.clone());
    }
    match decode_value::<Vec<String>>(&request.params) {
        Ok(params) if params.len() >= 2 => {
            let mut params = params.into_iter();
            Some((params.next()?, params.next()?))
        }
        _ => None,
    }
}

fn reply<T: Serialize + ?Sized>(session: &Session, id: u64, result: &T) {
    match encode_value(result) {
        Ok(result) => {
            session.send(&Response::result(id, result));
        }
        Err(e) => warn!(error = %e, "Failed to encode reply"),
    }
}

fn reply_error(session: &Session, id: u64, status: Status, message: &str) {
    if id != 0 {
        session.send(&Response::error(
            id,
            ResponseError::new(status, message, Bytes::new()),
        ));
    }
}
