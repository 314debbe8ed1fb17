//! Real-time release of framed units.
//!
//! A [`Pacer`] owns a private cursor over a shared [`MediaCache`] and, on
//! every tick, feeds the next window to its framer and pushes the resulting
//! units into the session queue:
//!
//! | Media | Tick | Window | Framer |
//! |-------|------|--------|--------|
//! | audio | 20 ms | 160 bytes | [`AudioFramer`] |
//! | video | 40 ms | 4096 bytes | [`NalFramer`] |
//!
//! When the cache runs out, a looping pacer pauses and rewinds; otherwise it
//! exits. The stop signal is observed at tick boundaries, during the loop
//! pause and while blocked on a full queue, so a stop takes effect within
//! one tick.

use std::time::Duration;

use crossbeam_channel::{Sender, select};

use crate::config::LoadgenConfig;
use crate::media::annexb::NalFramer;
use crate::media::audio::{AudioFramer, AudioStep};
use crate::media::{CacheCursor, FramedUnit, MediaCache, MediaKind, Window};
use crate::shutdown::ShutdownSignal;

/// Why a pacer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacerExit {
    /// The stop signal fired.
    Stopped,
    /// A non-looping source was read to the end (or the cache is empty).
    Finished,
    /// The queue consumer went away.
    ConsumerGone,
}

/// Summary returned when a pacer exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacerStats {
    pub units: u64,
    /// Completed passes over the cache.
    pub passes: u64,
    pub exit: PacerExit,
}

enum Source {
    Audio(AudioFramer),
    Video { cursor: CacheCursor, framer: NalFramer },
}

/// Periodic driver for one session's media source.
pub struct Pacer {
    source: Source,
    interval: Duration,
    looping: bool,
    loop_pause: Duration,
    empty: bool,
}

impl Pacer {
    /// 160-byte frames every 20 ms by default.
    pub fn audio(cache: MediaCache, frame_size: usize, interval: Duration) -> Self {
        Self {
            empty: cache.is_empty(),
            source: Source::Audio(AudioFramer::new(cache, frame_size)),
            interval,
            looping: false,
            loop_pause: Duration::ZERO,
        }
    }

    /// 4096-byte windows through a [`NalFramer`] every 40 ms by default.
    pub fn video(cache: MediaCache, window: usize, timestamp_step: u32, interval: Duration) -> Self {
        Self {
            empty: cache.is_empty(),
            source: Source::Video {
                cursor: cache.cursor(window),
                framer: NalFramer::new(timestamp_step),
            },
            interval,
            looping: false,
            loop_pause: Duration::ZERO,
        }
    }

    /// Build the pacer a session of `kind` uses under `config`.
    pub fn for_kind(kind: MediaKind, cache: MediaCache, config: &LoadgenConfig) -> Self {
        match kind {
            MediaKind::Audio => Self::audio(
                cache,
                config.audio.frame_size,
                Duration::from_millis(config.audio.interval_ms),
            ),
            MediaKind::Video => Self::video(
                cache,
                config.video.window_size,
                config.video.timestamp_step,
                Duration::from_millis(config.video.interval_ms),
            ),
        }
    }

    /// Replay the cache indefinitely, pausing `pause` before each rewind.
    pub fn looping(mut self, pause: Duration) -> Self {
        self.looping = true;
        self.loop_pause = pause;
        self
    }

    /// Drive the source until it finishes, the consumer disappears or
    /// `stop` fires. Intended to run on its own thread.
    pub fn run(mut self, queue: Sender<FramedUnit>, stop: ShutdownSignal) -> PacerStats {
        let ticker = crossbeam_channel::tick(self.interval);
        let mut units = 0u64;
        let mut passes = 0u64;

        let exit = loop {
            select! {
                recv(ticker) -> _ => {}
                recv(stop.receiver()) -> _ => break PacerExit::Stopped,
            }
            if stop.is_triggered() {
                break PacerExit::Stopped;
            }

            let (batch, end_of_pass) = self.pull();
            if let Err(exit) = forward_all(&queue, batch, &stop, &mut units) {
                break exit;
            }
            if !end_of_pass {
                continue;
            }

            passes += 1;
            tracing::debug!(passes, units, looping = self.looping, "media pass complete");

            if !self.looping || self.empty {
                let tail = self.finish();
                if let Err(exit) = forward_all(&queue, tail, &stop, &mut units) {
                    break exit;
                }
                break PacerExit::Finished;
            }
            if stop.wait_timeout(self.loop_pause) {
                break PacerExit::Stopped;
            }
            self.rewind();
        };

        tracing::debug!(units, passes, ?exit, "pacer exited");
        PacerStats { units, passes, exit }
    }

    /// Read the next window. The flag is set when the cache has no more
    /// data after this window.
    fn pull(&mut self) -> (Vec<FramedUnit>, bool) {
        match &mut self.source {
            Source::Audio(framer) => match framer.next_frame() {
                AudioStep::Frame(frame) => (vec![FramedUnit::Audio(frame)], false),
                AudioStep::Tail(frame) => (vec![FramedUnit::Audio(frame)], true),
                AudioStep::Exhausted => (Vec::new(), true),
            },
            Source::Video { cursor, framer } => {
                let (window, end_of_pass) = match cursor.next_window() {
                    Window::Full(bytes) => (bytes, false),
                    Window::Tail(bytes) => (bytes, true),
                    Window::Exhausted => (&[][..], true),
                };
                let units = framer
                    .extract_units(window)
                    .into_iter()
                    .map(FramedUnit::Nal)
                    .collect();
                (units, end_of_pass)
            }
        }
    }

    fn finish(&mut self) -> Vec<FramedUnit> {
        match &mut self.source {
            Source::Audio(_) => Vec::new(),
            Source::Video { framer, .. } => framer.finish().map(FramedUnit::Nal).into_iter().collect(),
        }
    }

    fn rewind(&mut self) {
        match &mut self.source {
            Source::Audio(framer) => framer.rewind(),
            Source::Video { cursor, .. } => cursor.rewind(),
        }
    }
}

/// Enqueue units in order, blocking on a full queue until space frees up
/// or `stop` fires.
fn forward_all(
    queue: &Sender<FramedUnit>,
    batch: Vec<FramedUnit>,
    stop: &ShutdownSignal,
    count: &mut u64,
) -> Result<(), PacerExit> {
    for unit in batch {
        select! {
            send(queue, unit) -> sent => sent.map_err(|_| PacerExit::ConsumerGone)?,
            recv(stop.receiver()) -> _ => return Err(PacerExit::Stopped),
        }
        *count += 1;
    }
    Ok(())
}
