//! Registered methods and their handler chains.

use std::fmt;
use std::sync::Arc;

use crate::chunk::ChunkProcessor;
use crate::context::Context;
use crate::error::HandlerResult;

/// A middleware or terminal handler.
pub type Handler = Arc<dyn Fn(&mut Context) -> HandlerResult + Send + Sync>;

/// Wraps a closure into a [`Handler`].
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&mut Context) -> HandlerResult + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Per-method overrides of the engine size limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MethodOptions {
    /// Maximum size of the files carried by one request.
    pub max_size: Option<usize>,
    /// Maximum size of one chunk.
    pub max_chunk_size: Option<usize>,
    /// Maximum size of an assembled file.
    pub max_file_size: Option<usize>,
}

impl MethodOptions {
    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = Some(size);
        self
    }

    pub fn with_max_chunk_size(mut self, size: usize) -> Self {
        self.max_chunk_size = Some(size);
        self
    }

    pub fn with_max_file_size(mut self, size: usize) -> Self {
        self.max_file_size = Some(size);
        self
    }
}

/// A callable method: local middleware followed by one terminal handler.
pub struct Method {
    name: String,
    middleware: Vec<Handler>,
    handler: Handler,
    options: MethodOptions,
    chunk_processor: Option<Arc<dyn ChunkProcessor>>,
}

impl Method {
    pub(crate) fn new(name: String, handler: Handler) -> Self {
        Self {
            name,
            middleware: Vec::new(),
            handler,
            options: MethodOptions::default(),
            chunk_processor: None,
        }
    }

    /// Name as registered.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends middleware that runs before the handler, after global middleware.
    pub fn middleware<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&mut Context) -> HandlerResult + Send + Sync + 'static,
    {
        self.middleware.push(Arc::new(f));
        self
    }

    /// Overrides the engine size limits for this method.
    pub fn options(&mut self, options: MethodOptions) -> &mut Self {
        self.options = options;
        self
    }

    /// Replaces the engine chunk processor for this method.
    pub fn chunk_processor<P: ChunkProcessor + 'static>(&mut self, processor: P) -> &mut Self {
        self.chunk_processor = Some(Arc::new(processor));
        self
    }

    pub(crate) fn method_options(&self) -> MethodOptions {
        self.options
    }

    pub(crate) fn processor(&self) -> Option<Arc<dyn ChunkProcessor>> {
        self.chunk_processor.clone()
    }

    /// Global middleware, then this method's middleware, then the handler.
    pub(crate) fn chain(&self, global: &[Handler]) -> Vec<Handler> {
        let mut chain = Vec::with_capacity(global.len() + self.middleware.len() + 1);
        chain.extend(global.iter().cloned());
        chain.extend(self.middleware.iter().cloned());
        chain.push(self.handler.clone());
        chain
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("middleware", &self.middleware.len())
            .field("options", &self.options)
            .field("chunk_processor", &self.chunk_processor.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_order() {
        let global = vec![handler(|_| Ok(())), handler(|_| Ok(()))];
        let mut method = Method::new("Sum".into(), handler(|_| Ok(())));
        method.middleware(|_| Ok(())).options(MethodOptions::default().with_max_size(10));

        let chain = method.chain(&global);
        assert_eq!(chain.len(), 4);
        assert!(Arc::ptr_eq(&chain[0], &global[0]));
        assert!(Arc::ptr_eq(&chain[3], &method.handler));
        assert_eq!(method.method_options().max_size, Some(10));
    }
}
