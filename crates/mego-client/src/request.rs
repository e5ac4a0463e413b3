//! Request builder and the chunked upload driver.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use mego_protocol::{RawFile, Request, Response, decode_value, encode_value};

use crate::client::{Client, into_result};
use crate::error::{ClientError, ClientResult};
use crate::file::{Chunk, ChunkReader, FileSource};

/// A call being assembled. Nothing is sent until [`end`](Self::end).
///
/// ```rust,no_run
/// # async fn run(client: &mego_client::Client) -> mego_client::ClientResult<()> {
/// let sum: i64 = client.call("Sum").send(&[3, 4]).end_struct().await?;
/// # Ok(())
/// # }
/// ```
#[must_use = "a request is only sent by `end` or `end_struct`"]
pub struct RequestBuilder<'a> {
    client: &'a Client,
    method: String,
    params: Bytes,
    files: BTreeMap<String, Vec<FileSource>>,
    chunked: Option<(String, FileSource)>,
    field_seq: usize,
    chunk_size: usize,
    timeout: Duration,
    error: Option<ClientError>,
}

impl<'a> RequestBuilder<'a> {
    pub(crate) fn new(client: &'a Client, method: String) -> Self {
        let config = client.config();
        Self {
            client,
            method,
            params: Bytes::new(),
            files: BTreeMap::new(),
            chunked: None,
            field_seq: 0,
            chunk_size: config.chunk_size,
            timeout: config.timeout(),
            error: None,
        }
    }

    /// Sets the parameters.
    pub fn send<T: Serialize + ?Sized>(mut self, params: &T) -> Self {
        match encode_value(params) {
            Ok(params) => self.params = params,
            Err(e) => self.fail(e.into()),
        }
        self
    }

    /// Attaches a whole file under `field`, or under the next `FileN` name.
    pub fn send_file(mut self, source: impl Into<FileSource>, field: Option<&str>) -> Self {
        if self.chunked.is_some() {
            self.fail(ClientError::ChunkWithFiles);
            return self;
        }
        let field = self.field_name(field);
        self.files.entry(field).or_default().push(source.into());
        self
    }

    /// Attaches several whole files under one field.
    pub fn send_files<I, S>(mut self, sources: I, field: Option<&str>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<FileSource>,
    {
        if self.chunked.is_some() {
            self.fail(ClientError::ChunkWithFiles);
            return self;
        }
        let field = self.field_name(field);
        self.files
            .entry(field)
            .or_default()
            .extend(sources.into_iter().map(Into::into));
        self
    }

    /// Uploads a file in parts. It must be the only file of the request.
    pub fn send_file_chunks(mut self, source: impl Into<FileSource>, field: Option<&str>) -> Self {
        if self.chunked.is_some() || !self.files.is_empty() {
            self.fail(ClientError::ChunkWithFiles);
            return self;
        }
        let field = self.field_name(field);
        self.chunked = Some((field, source.into()));
        self
    }

    /// Sets the size of each uploaded part.
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Sets how long to wait for each response.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sends the request and waits for its result payload.
    pub async fn end(mut self) -> ClientResult<Bytes> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        let response = match self.chunked.take() {
            Some((field, source)) => self.upload_chunks(field, source).await?,
            None => self.exchange().await?,
        };
        into_result(response)
    }

    /// Sends the request and decodes its result into `T`.
    pub async fn end_struct<T: DeserializeOwned>(self) -> ClientResult<T> {
        let result = self.end().await?;
        Ok(decode_value(&result)?)
    }

    fn fail(&mut self, error: ClientError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    fn field_name(&mut self, field: Option<&str>) -> String {
        match field {
            Some(field) => field.to_string(),
            None => {
                self.field_seq += 1;
                format!("File{}", self.field_seq)
            }
        }
    }

    async fn exchange(&mut self) -> ClientResult<Response> {
        let mut files = BTreeMap::new();
        for (field, sources) in std::mem::take(&mut self.files) {
            let mut raw = Vec::with_capacity(sources.len());
            for source in sources {
                let (name, data) = source.read_all()?;
                raw.push(RawFile::whole(data, self.client.next_file_id(), name));
            }
            files.insert(field, raw);
        }

        let link = self.client.link()?;
        let mut slot = link.register()?;
        let mut request = Request::call(self.method.as_str(), self.params.clone(), slot.id());
        request.files = files;
        link.send(&request)?;

        let response = slot.wait(self.timeout, &self.method).await?;
        if response.is_chunk_next() || response.is_chunk_abort() {
            return Err(ClientError::Protocol(format!(
                "unexpected {} for a request without chunks",
                response.event
            )));
        }
        Ok(response)
    }

    async fn upload_chunks(&mut self, field: String, source: FileSource) -> ClientResult<Response> {
        let (name, reader) = source.open()?;
        let file_id = self.client.next_file_id();
        let mut chunks = ChunkReader::new(reader, file_id, self.chunk_size)?;
        debug!(
            method = %self.method,
            file = %name,
            parts = chunks.total(),
            "starting chunked upload"
        );

        let link = self.client.link()?;
        let mut slot = link.register()?;

        while let Some(chunk) = chunks.next().transpose()? {
            let is_final = chunk.is_final();
            let Chunk {
                file_id,
                part,
                total,
                bin,
            } = chunk;
            let params = if part == 1 {
                self.params.clone()
            } else {
                Bytes::new()
            };
            let mut request = Request::call(self.method.as_str(), params, slot.id());
            request.files.insert(
                field.clone(),
                vec![RawFile::chunk(bin, file_id, total, part, name.as_str())],
            );
            link.send(&request)?;

            let response = slot.wait(self.timeout, &self.method).await?;
            if response.is_chunk_abort() {
                let error = response.error.unwrap_or_default();
                debug!(part, code = error.code, "upload aborted by server");
                return Err(ClientError::Aborted(error.into()));
            }
            if !response.is_chunk_next() {
                return Ok(response);
            }
            if is_final {
                return Err(ClientError::Protocol(
                    "server asked for a part after the final one".into(),
                ));
            }
        }

        Err(ClientError::Protocol(
            "upload ended without a response".into(),
        ))
    }
}
