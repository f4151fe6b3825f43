// Body capture - size and status accounting around the proxied response
//
// The request body is read once into bytes (measured, then reused for
// forwarding), so only the response side needs a wrapper: a stream adapter
// that pipes backend bytes through the SSE post-processor (and optionally
// the Anthropic stream translator), counts what actually leaves, and
// reports the request to the metrics sink exactly once - at stream end or
// on client disconnect.

use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use crate::metrics::Metrics;
use crate::proxy::postprocess::SsePostProcessor;
use crate::translation::stream::AnthropicStreamTranslator;

/// One-shot metrics reporter for a proxied request
pub struct ResponseRecorder {
    metrics: Arc<Metrics>,
    path: String,
    status: u16,
    started: Instant,
    request_bytes: usize,
}

impl ResponseRecorder {
    pub fn new(
        metrics: Arc<Metrics>,
        path: &str,
        status: u16,
        started: Instant,
        request_bytes: usize,
    ) -> Self {
        Self {
            metrics,
            path: path.to_string(),
            status,
            started,
            request_bytes,
        }
    }

    pub fn record(self, response_bytes: usize) {
        self.metrics.record_request(
            &self.path,
            self.status,
            self.started.elapsed(),
            self.request_bytes,
            response_bytes,
        );
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// Backend response body run through the post-processing pipeline
pub struct ProcessedBody {
    inner: ByteStream,
    postprocessor: SsePostProcessor,
    translator: Option<AnthropicStreamTranslator>,
    recorder: Option<ResponseRecorder>,
    response_bytes: usize,
    finished: bool,
}

impl ProcessedBody {
    pub fn new(
        inner: ByteStream,
        postprocessor: SsePostProcessor,
        translator: Option<AnthropicStreamTranslator>,
        recorder: ResponseRecorder,
    ) -> Self {
        Self {
            inner,
            postprocessor,
            translator,
            recorder: Some(recorder),
            response_bytes: 0,
            finished: false,
        }
    }

    fn transform(&mut self, bytes: &[u8]) -> Vec<u8> {
        let processed = self.postprocessor.process(bytes);
        match &mut self.translator {
            Some(translator) => translator.push(&processed),
            None => processed,
        }
    }

    fn final_flush(&mut self) -> Vec<u8> {
        let tail = self.postprocessor.finish();
        match &mut self.translator {
            Some(translator) => {
                let mut out = translator.push(&tail);
                out.extend(translator.finish());
                out
            }
            None => tail,
        }
    }

    fn record_once(&mut self) {
        if let Some(recorder) = self.recorder.take() {
            recorder.record(self.response_bytes);
        }
    }
}

impl Stream for ProcessedBody {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.finished {
                return Poll::Ready(None);
            }
            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let out = this.transform(&bytes);
                    if out.is_empty() {
                        // Buffered (XML mode) or deduplicated away; keep pulling
                        continue;
                    }
                    this.response_bytes += out.len();
                    return Poll::Ready(Some(Ok(Bytes::from(out))));
                }
                Poll::Ready(Some(Err(e))) => {
                    tracing::warn!("backend stream error mid-proxy: {}", e);
                    this.finished = true;
                    this.record_once();
                    return Poll::Ready(Some(Err(std::io::Error::other(e))));
                }
                Poll::Ready(None) => {
                    this.finished = true;
                    let tail = this.final_flush();
                    this.record_once();
                    if tail.is_empty() {
                        return Poll::Ready(None);
                    }
                    this.response_bytes += tail.len();
                    return Poll::Ready(Some(Ok(Bytes::from(tail))));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Drop for ProcessedBody {
    fn drop(&mut self) {
        // Client disconnect mid-stream still produces one metrics record
        self.record_once();
    }
}
