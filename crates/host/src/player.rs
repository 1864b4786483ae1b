//! Media session
//!
//! A [`MediaPlayer`] owns everything one opened media item needs: a private
//! namespace directory, the control endpoint, the data worker and the decoder
//! process. Several players may coexist; they share nothing.
//!
//! Threading: every method runs on the caller's thread (the render tick).
//! Only the data worker runs elsewhere, and it talks back through a channel
//! drained in [`MediaPlayer::update`].

use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::time::Duration;

use mb_protocol::{Command, Opcode, ProtocolError};
use tracing::{debug, error, info, trace, warn};

use crate::control::ControlChannel;
use crate::data::{DataEvent, DataServer};
use crate::frame::CurrentFrame;
use crate::namespace::Namespace;
use crate::process::DecoderProcess;
use crate::source::stream_len;
use crate::{FrameImporter, MediaSource, PlayerConfig, PlayerError, PlayerEvents, Result};

/// Duration operand the decoder sends when the stream length is unknown.
const UNKNOWN_DURATION: u64 = u64::MAX;

// ----------------------------------------------------------------------------
// Session state
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unopened,
    /// Creating the namespace and endpoints, launching the decoder.
    Spawning,
    /// Waiting for the decoder to register and report `MediaLoaded`.
    Handshaking,
    Ready,
    Playing,
    Paused,
    /// A `Stop` is being delivered.
    Stopping,
    TornDown,
    Failed,
}

impl SessionState {
    fn accepts_commands(self) -> bool {
        matches!(
            self,
            SessionState::Handshaking
                | SessionState::Ready
                | SessionState::Playing
                | SessionState::Paused
                | SessionState::Stopping
        )
    }
}

// ----------------------------------------------------------------------------
// MediaPlayer
// ----------------------------------------------------------------------------

/// One opened media item, backed by its own decoder process.
pub struct MediaPlayer {
    config: PlayerConfig,
    state: SessionState,
    events: Box<dyn PlayerEvents>,

    namespace: Option<Namespace>,
    process: Option<DecoderProcess>,
    control: Option<ControlChannel>,
    data: Option<DataServer>,

    frame: CurrentFrame,
    /// `Stop`/`Seek` commands whose `Flushed` has not come back yet. Frames
    /// arriving meanwhile predate the flush and are dropped.
    flushes_pending: u32,
    valid: bool,
    duration: Option<Duration>,
    position: Option<Duration>,
    width: u32,
    height: u32,

    volume: f32,
    balance: f32,
    muted: bool,
    speed_ratio: f32,
    scrubbing: bool,
}

impl MediaPlayer {
    /// Launch a decoder for `source` and wait for it to register.
    ///
    /// Returns once the handshake completed; `MediaLoaded` (and
    /// [`PlayerEvents::media_opened`]) arrive through later [`update`]
    /// calls. On failure everything created so far is torn down and
    /// [`PlayerEvents::media_failed`] has been called once.
    ///
    /// [`update`]: MediaPlayer::update
    pub fn open<S, E>(config: PlayerConfig, source: S, events: E) -> Result<Self>
    where
        S: MediaSource + 'static,
        E: PlayerEvents + 'static,
    {
        let mut player = Self::new(config, Box::new(events));

        match player.start(Box::new(source)) {
            Ok(()) => Ok(player),
            Err(e) => {
                let e = player.fail(e);
                player.close();
                Err(e)
            }
        }
    }

    fn new(config: PlayerConfig, events: Box<dyn PlayerEvents>) -> Self {
        Self {
            config,
            state: SessionState::Unopened,
            events,
            namespace: None,
            process: None,
            control: None,
            data: None,
            frame: CurrentFrame::default(),
            flushes_pending: 0,
            valid: false,
            duration: None,
            position: None,
            width: 2,
            height: 2,
            volume: 0.5,
            balance: 0.5,
            muted: false,
            speed_ratio: 1.0,
            scrubbing: false,
        }
    }

    fn start(&mut self, mut source: Box<dyn MediaSource>) -> Result<()> {
        self.state = SessionState::Spawning;

        let stream_size =
            stream_len(source.as_mut()).map_err(PlayerError::setup("measuring the stream"))?;

        let namespace = Namespace::create(&self.config.namespace_root())
            .map_err(PlayerError::setup("creating the namespace"))?;
        let layout = namespace.layout().clone();
        self.namespace = Some(namespace);

        let mut control = ControlChannel::bind(&layout.host_control())
            .map_err(PlayerError::setup("binding the control endpoint"))?;

        let listener = UnixListener::bind(layout.data())
            .map_err(PlayerError::setup("binding the data endpoint"))?;
        self.data = Some(
            DataServer::spawn(listener, &layout.data(), source)
                .map_err(PlayerError::setup("starting the data worker"))?,
        );

        let process = self.process.insert(DecoderProcess::spawn(
            &self.config.decoder_path,
            layout.dir(),
            stream_size,
            &self.config.decoder_log_level,
        )?);

        self.state = SessionState::Handshaking;
        control.handshake(self.config.handshake_timeout(), || decoder_alive(process))?;

        info!(
            pid = process.pid(),
            stream_size,
            "Session ready, decoder at {}",
            control.peer().map(|p| p.display().to_string()).unwrap_or_default()
        );
        self.control = Some(control);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Per-tick processing
    // ------------------------------------------------------------------------

    /// Process everything the decoder and the data worker sent since the
    /// last call. Call once per tick, before [`render`](Self::render).
    ///
    /// Returns an error once the session has failed or been closed.
    pub fn update(&mut self) -> Result<()> {
        if !self.state.accepts_commands() {
            return Err(PlayerError::Closed);
        }

        self.drain_control()?;

        while let Some(event) = self.data.as_ref().and_then(DataServer::try_event) {
            match event {
                DataEvent::Closed { served, short_read } => {
                    debug!(served, short_read, "Data connection closed")
                }
                DataEvent::SourceError(e) => warn!("Media source error: {}", e),
                DataEvent::Desync(e) => warn!("Dropped data connection: {}", e),
            }
        }

        self.check_decoder()
    }

    fn drain_control(&mut self) -> Result<()> {
        loop {
            let next = match &self.control {
                Some(control) => control.try_recv(),
                None => return Err(PlayerError::Closed),
            };

            match next {
                Ok(Some((cmd, handle))) => self.handle_message(cmd, handle)?,
                Ok(None) => return Ok(()),
                Err(ProtocolError::UnknownOpcode(op)) => {
                    debug!("Ignoring unknown opcode {:#x} from decoder", op)
                }
                Err(e) => return Err(self.fail(e.into())),
            }
        }
    }

    fn handle_message(&mut self, cmd: Command, handle: Option<OwnedFd>) -> Result<()> {
        match cmd.opcode {
            Opcode::NewFrame => {
                let Some(handle) = handle else {
                    return Err(self.fail(ProtocolError::MissingHandle.into()));
                };
                if self.flushes_pending > 0 {
                    trace!(pts = cmd.arg0, "Dropping frame from before the flush");
                    return Ok(());
                }
                let (width, height) = cmd.dimensions();
                trace!(pts = cmd.arg0, width, height, "NewFrame");

                self.frame.receive(handle, cmd.arg0, width, height);
                self.width = width;
                self.height = height;
                self.position = Some(Duration::from_nanos(cmd.arg0));
                return Ok(());
            }
            Opcode::MediaLoaded => {
                let (width, height) = cmd.dimensions();
                self.valid = true;
                self.width = width;
                self.height = height;
                self.duration =
                    (cmd.arg0 != UNKNOWN_DURATION).then(|| Duration::from_nanos(cmd.arg0));
                if self.state == SessionState::Handshaking {
                    self.state = SessionState::Ready;
                }

                info!(width, height, duration = ?self.duration, "Media loaded");
                self.events.media_opened();
            }
            Opcode::MediaEnded if self.flushes_pending > 0 => {
                debug!("Ignoring end of stream from before the flush")
            }
            Opcode::MediaEnded => {
                info!("Media ended");
                if self.duration.is_some() {
                    self.position = self.duration;
                }
                if self.state == SessionState::Playing {
                    self.state = SessionState::Ready;
                }
                self.events.media_ended();
            }
            Opcode::MediaFailed => return Err(self.fail(PlayerError::MediaFailed)),
            Opcode::Flushed => {
                self.flushes_pending = self.flushes_pending.saturating_sub(1);
                debug!(position = cmd.arg0, pending = self.flushes_pending, "Decoder flushed");
            }
            Opcode::Hello => debug!("Ignoring repeated decoder registration"),
            other => warn!("Unexpected {:?} from decoder", other),
        }

        if handle.is_some() {
            warn!("Closing descriptor attached to {:?}", cmd.opcode);
        }
        Ok(())
    }

    fn check_decoder(&mut self) -> Result<()> {
        let Some(Err(exited)) = self.process.as_mut().map(decoder_alive) else {
            return Ok(());
        };

        // A final MediaFailed queued before the exit takes precedence
        self.drain_control()?;
        Err(self.fail(exited))
    }

    /// True when a frame arrived that has not been rendered yet.
    pub fn has_new_frame(&self) -> bool {
        self.frame.has_new()
    }

    /// Draw the held frame, or the fallback when there is none.
    ///
    /// The frame's descriptor is closed right after the draw and its
    /// timestamp acknowledged, letting the decoder release every buffer up to
    /// and including it.
    pub fn render<I: FrameImporter + ?Sized>(&mut self, importer: &mut I) {
        let Some(pending) = self.frame.take_for_render() else {
            importer.draw_fallback();
            return;
        };

        importer.draw_frame(&pending.import());
        let pts = pending.pts;
        drop(pending);

        if let Some(control) = &self.control {
            match control.send(&Command::frame_ack(pts)) {
                Ok(()) => {}
                // The next ack covers this one
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => debug!(pts, "Ack dropped"),
                Err(e) => warn!(pts, "Failed to acknowledge frame: {}", e),
            }
        }
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    pub fn play(&mut self) -> Result<()> {
        self.send_state_change(Command::bare(Opcode::Play), "play")?;
        self.state = SessionState::Playing;
        Ok(())
    }

    pub fn pause(&mut self) -> Result<()> {
        self.send_state_change(Command::bare(Opcode::Pause), "pause")?;
        self.state = SessionState::Paused;
        Ok(())
    }

    /// Stop and rewind. The decoder drops every outstanding frame, so the
    /// next render draws the fallback.
    pub fn stop(&mut self) -> Result<()> {
        self.begin_flush()?;
        let previous = self.state;
        self.state = SessionState::Stopping;
        self.position = Some(Duration::ZERO);

        let result = self.send_state_change(Command::bare(Opcode::Stop), "stop");
        if result.is_ok() {
            self.flushes_pending += 1;
        }
        if self.state == SessionState::Stopping {
            self.state = if result.is_ok() {
                SessionState::Ready
            } else {
                previous
            };
        }
        result
    }

    /// Flushing seek to `position`.
    pub fn seek(&mut self, position: Duration) -> Result<()> {
        self.begin_flush()?;
        self.position = Some(position);

        let ns = u64::try_from(position.as_nanos()).unwrap_or(u64::MAX);
        self.send_state_change(Command::seek(ns), "seek")?;
        self.flushes_pending += 1;
        Ok(())
    }

    pub fn set_volume(&mut self, volume: f32) -> Result<()> {
        self.send_state_change(Command::set_volume(volume), "set_volume")?;
        debug!(volume, "Volume set");
        self.volume = volume;
        Ok(())
    }

    /// Handle whatever is already queued, then forget the current frame.
    fn begin_flush(&mut self) -> Result<()> {
        self.ensure_live()?;
        self.drain_control()?;
        self.frame.reset();
        Ok(())
    }

    fn send_state_change(&mut self, cmd: Command, what: &'static str) -> Result<()> {
        self.ensure_live()?;

        let timeout = self.config.command_timeout();
        let sent = match &self.control {
            Some(control) => control.send_blocking(&cmd, timeout),
            None => return Err(PlayerError::Closed),
        };

        match sent {
            Ok(()) => Ok(()),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
            {
                warn!("Decoder did not accept {} within {:?}", what, timeout);
                Err(PlayerError::CommandTimeout(what, timeout))
            }
            Err(e) => Err(self.fail(e.into())),
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.state.accepts_commands() && self.control.is_some() {
            Ok(())
        } else {
            Err(PlayerError::Closed)
        }
    }

    // ------------------------------------------------------------------------
    // Failure and teardown
    // ------------------------------------------------------------------------

    /// Mark the session failed and notify once. Returns `error` for propagation.
    fn fail(&mut self, error: PlayerError) -> PlayerError {
        if matches!(self.state, SessionState::Failed | SessionState::TornDown) {
            return error;
        }

        error!("Session failed: {}", error);
        self.state = SessionState::Failed;
        self.valid = false;
        self.frame.reset();
        self.events.media_failed(&error);
        error
    }

    /// Kill and reap the decoder, stop the data worker, remove the namespace.
    ///
    /// Idempotent; also runs on drop.
    pub fn close(&mut self) {
        if self.state == SessionState::TornDown {
            return;
        }
        let previous = self.state;

        if let Some(mut process) = self.process.take() {
            process.terminate();
        }
        // The decoder is gone, so its data connection has closed too
        if let Some(mut data) = self.data.take() {
            data.shutdown();
        }
        self.control = None;
        self.frame.reset();
        self.flushes_pending = 0;
        if let Some(mut namespace) = self.namespace.take() {
            namespace.cleanup();
        }

        self.valid = false;
        self.state = SessionState::TornDown;
        info!("Session closed (was {:?})", previous);
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// True between `MediaLoaded` and failure or close.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    /// Timestamp of the latest frame, or the target of the last stop/seek.
    pub fn position(&self) -> Option<Duration> {
        self.position
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn balance(&self) -> f32 {
        self.balance
    }

    pub fn set_balance(&mut self, balance: f32) {
        self.balance = balance;
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    pub fn speed_ratio(&self) -> f32 {
        self.speed_ratio
    }

    pub fn set_speed_ratio(&mut self, ratio: f32) {
        self.speed_ratio = ratio;
    }

    pub fn scrubbing_enabled(&self) -> bool {
        self.scrubbing
    }

    pub fn set_scrubbing_enabled(&mut self, enabled: bool) {
        self.scrubbing = enabled;
    }

    pub fn can_pause(&self) -> bool {
        true
    }

    /// Audio is never decoded.
    pub fn has_audio(&self) -> bool {
        false
    }

    pub fn has_video(&self) -> bool {
        self.valid
    }

    /// The whole stream is always reachable through the source.
    pub fn buffering_progress(&self) -> f32 {
        1.0
    }

    pub fn download_progress(&self) -> f32 {
        1.0
    }

    pub fn decoder_pid(&self) -> Option<u32> {
        self.process.as_ref().map(DecoderProcess::pid)
    }

    /// The session's private directory, until teardown.
    pub fn namespace_dir(&self) -> Option<&Path> {
        self.namespace.as_ref().map(Namespace::dir)
    }
}

impl Drop for MediaPlayer {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for MediaPlayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaPlayer")
            .field("state", &self.state)
            .field("pid", &self.decoder_pid())
            .field("width", &self.width)
            .field("height", &self.height)
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

fn decoder_alive(process: &mut DecoderProcess) -> Result<()> {
    match process.try_exited() {
        Some(status) => Err(PlayerError::DecoderExited(status.to_string())),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FrameImport;
    use mb_protocol::fdpass;
    use parking_lot::Mutex;
    use std::fs::File;
    use std::io::Cursor;
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixDatagram;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.0.lock().clone()
        }
    }

    impl PlayerEvents for Recorder {
        fn media_opened(&mut self) {
            self.0.lock().push("opened".into());
        }

        fn media_ended(&mut self) {
            self.0.lock().push("ended".into());
        }

        fn media_failed(&mut self, error: &PlayerError) {
            self.0.lock().push(format!("failed: {}", error));
        }
    }

    #[derive(Default)]
    struct Screen {
        frames: Vec<(Duration, u32, u32)>,
        fallbacks: usize,
    }

    impl FrameImporter for Screen {
        fn draw_frame(&mut self, frame: &FrameImport<'_>) {
            self.frames.push((frame.pts, frame.width, frame.height));
        }

        fn draw_fallback(&mut self) {
            self.fallbacks += 1;
        }
    }

    /// A player whose "decoder" is a socket held by the test.
    fn connected(events: Recorder) -> (MediaPlayer, UnixDatagram) {
        let namespace = Namespace::create(&std::env::temp_dir()).unwrap();
        let layout = namespace.layout().clone();

        let mut control = ControlChannel::bind(&layout.host_control()).unwrap();
        let decoder = UnixDatagram::bind(layout.decoder_control()).unwrap();
        decoder.connect(layout.host_control()).unwrap();
        decoder
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        decoder.send(&Command::hello().to_bytes()).unwrap();
        control.handshake(Duration::from_secs(2), || Ok(())).unwrap();

        let mut player = MediaPlayer::new(PlayerConfig::default(), Box::new(events));
        player.namespace = Some(namespace);
        player.control = Some(control);
        player.state = SessionState::Handshaking;
        (player, decoder)
    }

    fn send_frame(decoder: &UnixDatagram, pts: u64) {
        let buffer = File::open("/dev/null").unwrap();
        fdpass::send_command(decoder, &Command::new_frame(pts, 64, 48), Some(buffer.as_fd()))
            .unwrap();
    }

    #[test]
    fn test_initial_values() {
        let player = MediaPlayer::new(PlayerConfig::default(), Box::new(()));
        assert_eq!(player.state(), SessionState::Unopened);
        assert_eq!((player.width(), player.height()), (2, 2));
        assert_eq!(player.volume(), 0.5);
        assert_eq!(player.balance(), 0.5);
        assert_eq!(player.speed_ratio(), 1.0);
        assert!(player.duration().is_none());
        assert!(player.position().is_none());
        assert!(!player.is_valid());
    }

    #[test]
    fn test_loaded_then_render_latest_and_ack() {
        let events = Recorder::default();
        let (mut player, decoder) = connected(events.clone());

        decoder
            .send(&Command::media_loaded(4_000_000_000, 64, 48).to_bytes())
            .unwrap();
        send_frame(&decoder, 0);
        send_frame(&decoder, 40_000_000);

        player.update().unwrap();
        assert_eq!(events.events(), vec!["opened"]);
        assert_eq!(player.state(), SessionState::Ready);
        assert!(player.is_valid());
        assert_eq!(player.duration(), Some(Duration::from_secs(4)));
        assert!(player.has_new_frame());

        let mut screen = Screen::default();
        player.render(&mut screen);
        assert_eq!(screen.frames, vec![(Duration::from_millis(40), 64, 48)]);
        assert!(!player.has_new_frame());

        let (ack, handle) = fdpass::recv_command(&decoder).unwrap();
        assert_eq!(ack, Command::frame_ack(40_000_000));
        assert!(handle.is_none());

        // The descriptor was closed after the draw
        player.render(&mut screen);
        assert_eq!(screen.fallbacks, 1);
    }

    #[test]
    fn test_seek_flushes_and_sends_target() {
        let (mut player, decoder) = connected(Recorder::default());
        send_frame(&decoder, 500_000_000);
        player.update().unwrap();
        assert!(player.has_new_frame());

        player.seek(Duration::from_secs(2)).unwrap();
        assert!(!player.has_new_frame());
        assert_eq!(player.position(), Some(Duration::from_secs(2)));

        let (cmd, _) = fdpass::recv_command(&decoder).unwrap();
        assert_eq!(cmd, Command::seek(2_000_000_000));

        let mut screen = Screen::default();
        player.render(&mut screen);
        assert_eq!(screen.fallbacks, 1);

        // Published by the decoder before the seek reached it
        send_frame(&decoder, 540_000_000);
        decoder.send(&Command::flushed(2_000_000_000).to_bytes()).unwrap();
        send_frame(&decoder, 2_000_000_000);

        player.update().unwrap();
        player.render(&mut screen);
        assert_eq!(screen.frames, vec![(Duration::from_secs(2), 64, 48)]);
        assert_eq!(player.position(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_frames_before_flushed_are_never_rendered() {
        let (mut player, decoder) = connected(Recorder::default());
        player.play().unwrap();
        fdpass::recv_command(&decoder).unwrap();

        player.stop().unwrap();
        assert_eq!(fdpass::recv_command(&decoder).unwrap().0.opcode, Opcode::Stop);

        // The decoder was still playing when the stop arrived
        send_frame(&decoder, 120_000_000);
        send_frame(&decoder, 160_000_000);
        player.update().unwrap();
        assert!(!player.has_new_frame());
        assert_eq!(player.position(), Some(Duration::ZERO));

        let mut screen = Screen::default();
        player.render(&mut screen);
        assert!(screen.frames.is_empty());

        decoder.send(&Command::flushed(0).to_bytes()).unwrap();
        send_frame(&decoder, 0);
        player.update().unwrap();
        player.render(&mut screen);
        assert_eq!(screen.frames, vec![(Duration::ZERO, 64, 48)]);
    }

    #[test]
    fn test_back_to_back_seeks_wait_for_every_flush() {
        let events = Recorder::default();
        let (mut player, decoder) = connected(events.clone());

        player.seek(Duration::from_secs(1)).unwrap();
        player.seek(Duration::from_secs(3)).unwrap();
        fdpass::recv_command(&decoder).unwrap();
        fdpass::recv_command(&decoder).unwrap();

        // Preroll of the first seek lands between the two acknowledgements
        decoder.send(&Command::flushed(1_000_000_000).to_bytes()).unwrap();
        send_frame(&decoder, 1_000_000_000);
        decoder.send(&Command::media_ended().to_bytes()).unwrap();
        decoder.send(&Command::flushed(3_000_000_000).to_bytes()).unwrap();
        send_frame(&decoder, 3_000_000_000);

        player.update().unwrap();
        let mut screen = Screen::default();
        player.render(&mut screen);
        assert_eq!(screen.frames, vec![(Duration::from_secs(3), 64, 48)]);
        assert!(events.events().is_empty());
    }

    #[test]
    fn test_stop_discards_queued_frames() {
        let (mut player, decoder) = connected(Recorder::default());
        player.play().unwrap();
        assert_eq!(fdpass::recv_command(&decoder).unwrap().0.opcode, Opcode::Play);
        assert_eq!(player.state(), SessionState::Playing);

        // Queued before the stop, never seen by update()
        send_frame(&decoder, 80_000_000);

        player.stop().unwrap();
        assert_eq!(player.state(), SessionState::Ready);
        assert_eq!(fdpass::recv_command(&decoder).unwrap().0.opcode, Opcode::Stop);

        let mut screen = Screen::default();
        player.render(&mut screen);
        assert!(screen.frames.is_empty());
        assert_eq!(screen.fallbacks, 1);
    }

    #[test]
    fn test_volume_round_trip() {
        let (mut player, decoder) = connected(Recorder::default());

        player.set_volume(0.3).unwrap();
        let (cmd, _) = fdpass::recv_command(&decoder).unwrap();
        assert_eq!(cmd.volume().to_bits(), 0.3f32.to_bits());
        assert_eq!(player.volume().to_bits(), 0.3f32.to_bits());
    }

    #[test]
    fn test_media_failed_reported_once() {
        let events = Recorder::default();
        let (mut player, decoder) = connected(events.clone());

        decoder.send(&Command::media_failed().to_bytes()).unwrap();
        assert!(matches!(player.update(), Err(PlayerError::MediaFailed)));
        assert_eq!(player.state(), SessionState::Failed);
        assert!(!player.is_valid());

        assert!(matches!(player.update(), Err(PlayerError::Closed)));
        assert!(matches!(player.play(), Err(PlayerError::Closed)));
        assert_eq!(events.events().len(), 1);
        assert!(events.events()[0].starts_with("failed"));
    }

    #[test]
    fn test_short_datagram_fails_session() {
        let events = Recorder::default();
        let (mut player, decoder) = connected(events.clone());

        decoder.send(&[1, 2, 3]).unwrap();
        let err = player.update().unwrap_err();
        assert!(
            matches!(
                err,
                PlayerError::Protocol(ProtocolError::Truncated {
                    expected: 24,
                    got: 3
                })
            ),
            "unexpected {:?}",
            err
        );
        assert_eq!(player.state(), SessionState::Failed);
        assert!(!player.is_valid());

        assert!(matches!(player.update(), Err(PlayerError::Closed)));
        assert_eq!(events.events().len(), 1);
        assert!(events.events()[0].starts_with("failed"));
    }

    #[test]
    fn test_frame_without_handle_is_fatal() {
        let (mut player, decoder) = connected(Recorder::default());

        decoder
            .send(&Command::new_frame(0, 64, 48).to_bytes())
            .unwrap();
        let err = player.update().unwrap_err();
        assert!(matches!(err, PlayerError::Protocol(ProtocolError::MissingHandle)));
    }

    #[test]
    fn test_unknown_opcode_is_skipped() {
        let events = Recorder::default();
        let (mut player, decoder) = connected(events.clone());

        let mut bogus = Command::media_ended().to_bytes();
        bogus[0..4].copy_from_slice(&77u32.to_le_bytes());
        decoder.send(&bogus).unwrap();
        decoder.send(&Command::media_ended().to_bytes()).unwrap();

        player.update().unwrap();
        assert_eq!(events.events(), vec!["ended"]);
    }

    #[test]
    fn test_close_twice_removes_namespace() {
        let (mut player, _decoder) = connected(Recorder::default());
        let dir = player.namespace_dir().unwrap().to_path_buf();
        assert!(dir.exists());

        player.close();
        assert!(!dir.exists());
        assert_eq!(player.state(), SessionState::TornDown);

        player.close();
        assert!(matches!(player.update(), Err(PlayerError::Closed)));
    }

    #[test]
    fn test_open_with_missing_decoder_fails_cleanly() {
        let root = std::env::temp_dir().join(format!("mb-open-{}", uuid::Uuid::new_v4().simple()));
        std::fs::create_dir(&root).unwrap();

        let events = Recorder::default();
        let config = PlayerConfig {
            decoder_path: "/nonexistent/mb-decoder".into(),
            namespace_root: Some(root.clone()),
            ..PlayerConfig::default()
        };
        let err =
            MediaPlayer::open(config, Cursor::new(vec![0u8; 64]), events.clone()).unwrap_err();

        assert!(matches!(err, PlayerError::Spawn { .. }));
        assert_eq!(events.events().len(), 1);
        // Nothing left behind in the namespace root
        assert_eq!(std::fs::read_dir(&root).unwrap().count(), 0);

        std::fs::remove_dir(&root).unwrap();
    }

    #[test]
    fn test_open_fails_when_decoder_exits_before_registering() {
        let events = Recorder::default();
        let config = PlayerConfig {
            decoder_path: "/bin/false".into(),
            handshake_timeout_ms: 5_000,
            ..PlayerConfig::default()
        };

        let err = MediaPlayer::open(config, Cursor::new(Vec::new()), events.clone()).unwrap_err();

        assert!(matches!(err, PlayerError::DecoderExited(_)));
        assert_eq!(events.events().len(), 1);
    }
}
