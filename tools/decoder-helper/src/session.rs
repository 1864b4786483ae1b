//! Decoder control loop
//!
//! Interleaves the pipeline pump with the control-channel poll. Produced
//! samples go into the frame ring and are published to the host one
//! `NewFrame` at a time with the buffer attached; host acks release them.
//! Every `Stop` or `Seek` is answered with `Flushed` once the ring is empty,
//! so the host can tell frames from before the flush from those after it.

use std::os::fd::{AsFd, OwnedFd};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use mb_protocol::{Command, Opcode};
use tracing::{debug, error, info, trace, warn};

use crate::control::{is_host_gone, DecoderControl, Incoming};
use crate::pipeline::{Pipeline, PipelineEvent, Sample};
use crate::ring::{FrameRing, Timestamped};

/// How often the loop checks that the host endpoint still exists.
const HOST_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// The decoder's reference to a published frame.
#[derive(Debug)]
pub struct Frame {
    pts: u64,
    buffer: OwnedFd,
}

impl Timestamped for Frame {
    fn pts(&self) -> u64 {
        self.pts
    }
}

/// Whether the loop keeps going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

pub struct DecoderLoop<P> {
    control: DecoderControl,
    pipeline: P,
    ring: FrameRing<Frame>,
    poll_interval: Duration,
    last_host_check: Instant,
}

impl<P: Pipeline> DecoderLoop<P> {
    pub fn new(control: DecoderControl, pipeline: P, poll_interval: Duration) -> Self {
        Self {
            control,
            pipeline,
            ring: FrameRing::new(),
            poll_interval,
            last_host_check: Instant::now(),
        }
    }

    /// Preroll, report the outcome, then serve until the host goes away.
    pub fn run(mut self) -> Result<()> {
        if self.start()? == Flow::Exit {
            return Ok(());
        }

        while self.step()? == Flow::Continue {}

        info!(in_flight = self.ring.len(), "Decoder loop finished");
        Ok(())
    }

    /// Preroll the pipeline and send `MediaLoaded` or `MediaFailed`.
    pub fn start(&mut self) -> Result<Flow> {
        match self.pipeline.preroll() {
            Ok(media) => {
                info!(
                    width = media.width,
                    height = media.height,
                    duration_ns = ?media.duration_ns,
                    "Media loaded"
                );
                let duration = media.duration_ns.unwrap_or(u64::MAX);
                self.send(&Command::media_loaded(duration, media.width, media.height))
            }
            Err(e) => {
                error!("Preroll failed: {}", e);
                self.send(&Command::media_failed())?;
                Ok(Flow::Exit)
            }
        }
    }

    /// One iteration: drain due pipeline events, then wait briefly for a command.
    pub fn step(&mut self) -> Result<Flow> {
        // A full ring stalls the pipeline until the host acks
        while !self.ring.is_full() {
            let Some(event) = self.pipeline.poll() else {
                break;
            };
            if self.handle_event(event)? == Flow::Exit {
                return Ok(Flow::Exit);
            }
        }

        match self
            .control
            .recv_timeout(self.poll_interval)
            .context("control channel receive failed")?
        {
            Incoming::Command(cmd) => {
                if self.handle_command(cmd)? == Flow::Exit {
                    return Ok(Flow::Exit);
                }
            }
            Incoming::Idle => {}
        }

        if self.last_host_check.elapsed() >= HOST_CHECK_INTERVAL {
            self.last_host_check = Instant::now();
            if !self.control.host_present() {
                info!("Host endpoint is gone, exiting");
                return Ok(Flow::Exit);
            }
        }

        Ok(Flow::Continue)
    }

    fn handle_event(&mut self, event: PipelineEvent) -> Result<Flow> {
        match event {
            PipelineEvent::Sample(sample) => self.publish(sample),
            PipelineEvent::Prerolled => {
                debug!("Prerolled");
                Ok(Flow::Continue)
            }
            PipelineEvent::EndOfStream => self.send(&Command::media_ended()),
            PipelineEvent::Error(e) => {
                error!("Pipeline error: {}", e);
                self.send(&Command::media_failed())?;
                Ok(Flow::Exit)
            }
        }
    }

    /// Store the sample in the ring and hand a duplicate of its buffer to the host.
    fn publish(&mut self, sample: Sample) -> Result<Flow> {
        let Sample {
            pts_ns,
            width,
            height,
            buffer,
        } = sample;

        let frame = match self.ring.push(Frame {
            pts: pts_ns,
            buffer,
        }) {
            Ok(frame) => frame,
            Err(e) => {
                error!("{}", e);
                self.send(&Command::media_failed())?;
                return Ok(Flow::Exit);
            }
        };

        let cmd = Command::new_frame(pts_ns, width, height);
        let sent = self.control.send(&cmd, Some(frame.buffer.as_fd()));
        trace!(pts_ns, in_flight = self.ring.len(), "Published frame");

        match sent {
            Ok(()) => Ok(Flow::Continue),
            Err(e) if is_host_gone(&e) => {
                info!("Host is gone ({}), exiting", e);
                Ok(Flow::Exit)
            }
            Err(e) => Err(e).context("failed to publish frame"),
        }
    }

    fn handle_command(&mut self, cmd: Command) -> Result<Flow> {
        debug!(opcode = ?cmd.opcode, arg0 = cmd.arg0, "<- host");

        match cmd.opcode {
            Opcode::Play => self.pipeline.play(),
            Opcode::Pause => self.pipeline.pause(),
            Opcode::Stop => {
                let released = self.ring.flush();
                debug!(released, "Stop: flushed frame ring");
                self.pipeline.pause();
                self.pipeline.seek(0);
                return self.send(&Command::flushed(0));
            }
            Opcode::Seek => {
                let released = self.ring.flush();
                debug!(released, target_ns = cmd.arg0, "Seek: flushed frame ring");
                self.pipeline.seek(cmd.arg0);
                return self.send(&Command::flushed(cmd.arg0));
            }
            Opcode::SetVolume => {
                let volume = cmd.volume();
                self.pipeline.set_volume(volume as f64);
                debug!(volume, "Volume set");
            }
            Opcode::FrameAck => {
                self.ring.release_through(cmd.arg0);
            }
            other => warn!("Ignoring {:?} from host", other),
        }

        Ok(Flow::Continue)
    }

    fn send(&self, cmd: &Command) -> Result<Flow> {
        match self.control.send(cmd, None) {
            Ok(()) => Ok(Flow::Continue),
            Err(e) if is_host_gone(&e) => {
                info!("Host is gone ({}), exiting", e);
                Ok(Flow::Exit)
            }
            Err(e) => Err(e).with_context(|| format!("failed to send {:?}", cmd.opcode)),
        }
    }
}
