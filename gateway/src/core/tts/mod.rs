//! Streaming speech synthesis
//!
//! A [`Synthesizer`] opens one [`SynthesisStream`] per turn: text chunks are
//! pushed in as the orchestrator produces them, ordered 20 ms audio frames
//! come back out, and cancelling the stream's token stops frame emission
//! within the barge-in budget.

mod client;

pub use client::{StreamingTtsClient, TtsClientConfig};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::ClientError;
use crate::audio::AudioFrame;

/// Frames buffered between the synthesis task and the turn router. Sized to
/// the transport's high-water mark so a slow caller pauses synthesis reads
/// instead of ballooning memory.
pub const SYNTHESIS_FRAME_DEPTH: usize = 64;

/// Text chunks buffered toward the synthesis task.
pub const SYNTHESIS_TEXT_DEPTH: usize = 16;

/// Exclusive streaming synthesizer handle.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Open a cancellable synthesis stream for one turn.
    async fn open_stream(
        &mut self,
        voice: &str,
        cancel: CancellationToken,
    ) -> Result<SynthesisStream, ClientError>;

    fn provider_info(&self) -> &'static str;
}

/// One turn's worth of incremental synthesis.
///
/// Closing the text side (via [`SynthesisStream::finish`]) flushes the tail;
/// the frame channel then ends once the provider has emitted everything.
/// Cancelling the token aborts both directions immediately.
pub struct SynthesisStream {
    text_tx: Option<mpsc::Sender<String>>,
    frames_rx: Option<mpsc::Receiver<AudioFrame>>,
    cancel: CancellationToken,
}

impl SynthesisStream {
    pub fn new(
        text_tx: mpsc::Sender<String>,
        frames_rx: mpsc::Receiver<AudioFrame>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            text_tx: Some(text_tx),
            frames_rx: Some(frames_rx),
            cancel,
        }
    }

    /// Queue one text chunk for synthesis.
    pub async fn push_text(&self, chunk: &str) -> Result<(), ClientError> {
        let Some(tx) = &self.text_tx else {
            return Err(ClientError::ProviderError(
                "synthesis stream already finished".into(),
            ));
        };
        tx.send(chunk.to_string())
            .await
            .map_err(|_| ClientError::ConnectionFailed("synthesis task gone".into()))
    }

    /// Close the text side; remaining audio drains through the frame channel.
    pub fn finish(&mut self) {
        self.text_tx = None;
    }

    /// Take the frame receiver (once) so a forwarder task can own it.
    pub fn take_frames(&mut self) -> Option<mpsc::Receiver<AudioFrame>> {
        self.frames_rx.take()
    }

    /// Stop synthesis immediately. Frame emission ceases within 120 ms.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for SynthesisStream {
    fn drop(&mut self) {
        // An abandoned stream must not keep the provider synthesizing.
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_push_after_finish_fails() {
        let (text_tx, _text_rx) = mpsc::channel(4);
        let (_frames_tx, frames_rx) = mpsc::channel(4);
        let mut stream = SynthesisStream::new(text_tx, frames_rx, CancellationToken::new());

        stream.push_text("hello").await.unwrap();
        stream.finish();
        assert!(stream.push_text("again").await.is_err());
    }

    #[tokio::test]
    async fn test_drop_cancels() {
        let (text_tx, _text_rx) = mpsc::channel(4);
        let (_frames_tx, frames_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let stream = SynthesisStream::new(text_tx, frames_rx, cancel.clone());

        drop(stream);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_take_frames_is_single_use() {
        let (text_tx, _text_rx) = mpsc::channel(4);
        let (_frames_tx, frames_rx) = mpsc::channel(4);
        let mut stream = SynthesisStream::new(text_tx, frames_rx, CancellationToken::new());

        assert!(stream.take_frames().is_some());
        assert!(stream.take_frames().is_none());
    }
}
