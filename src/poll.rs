use crate::config::RenderConfig;
use crate::engine::{EngineEvent, JobHandle, Session};
use crate::error::Error;
use crate::frame::FrameBuilder;
use crate::history::RateHistory;
use crate::screen::Screen;
use std::io::{self, Write};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Minimum time between two frames.
pub const RENDER_INTERVAL: Duration = Duration::from_millis(120);
/// Pause between polls; bounds CPU use and interrupt latency.
pub const POLL_SLEEP: Duration = Duration::from_millis(80);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Finished,
    Interrupted,
}

impl LoopState {
    pub fn farewell(self) -> Option<&'static str> {
        match self {
            LoopState::Running => None,
            LoopState::Finished => Some("[done] Finished."),
            LoopState::Interrupted => Some("Goodbye."),
        }
    }
}

/// Drives one job: drains engine events, samples status, and redraws the
/// dashboard at a fixed cadence until the job finishes or the token fires.
pub struct PollLoop<'a, S: Session, W: Write, E: Write> {
    session: &'a mut S,
    handle: &'a S::Handle,
    builder: FrameBuilder<'a>,
    screen: Screen<W>,
    errors: E,
    history: RateHistory,
    tick: usize,
    last_render: Option<Instant>,
    finished: bool,
}

impl<'a, S: Session, W: Write, E: Write> PollLoop<'a, S, W, E> {
    pub fn new(
        session: &'a mut S,
        handle: &'a S::Handle,
        config: &'a RenderConfig,
        out: W,
        errors: E,
    ) -> Self {
        PollLoop {
            session,
            handle,
            builder: FrameBuilder::new(config),
            screen: Screen::new(out, config.clear),
            errors,
            history: RateHistory::new(),
            tick: 0,
            last_render: None,
            finished: false,
        }
    }

    pub fn history(&self) -> &RateHistory {
        &self.history
    }

    /// Engine errors are reported, never fatal, even when the error sink fails.
    fn drain_events(&mut self) {
        for event in self.session.drain_events() {
            match event {
                EngineEvent::Error(msg) => {
                    log::warn!("engine error: {}", msg);
                    if let Err(e) = writeln!(self.errors, "[error] {}", msg) {
                        log::warn!("Failed to report engine error: {}", e);
                    }
                }
                EngineEvent::Finished => {
                    log::info!("job finished");
                    self.finished = true;
                }
            }
        }
        if let Err(e) = self.errors.flush() {
            log::warn!("Failed to flush the error sink: {}", e);
        }
    }

    fn render_due(&self, now: Instant) -> bool {
        match self.last_render {
            None => true,
            Some(last) => now.duration_since(last) >= RENDER_INTERVAL,
        }
    }

    /// One iteration without the trailing sleep.
    pub fn step(&mut self, now: Instant) -> io::Result<LoopState> {
        self.drain_events();
        let status = self.handle.status();

        if self.render_due(now) {
            self.last_render = Some(now);
            self.tick = self.tick.wrapping_add(1);
            self.history.push(status.download_rate);
            let frame = self
                .builder
                .build(&status, self.history.snapshot(), self.tick);
            self.screen.present(&frame)?;
        }

        if self.finished {
            Ok(LoopState::Finished)
        } else {
            Ok(LoopState::Running)
        }
    }

    async fn spin(&mut self, cancel: &CancellationToken) -> io::Result<LoopState> {
        loop {
            if cancel.is_cancelled() {
                return Ok(LoopState::Interrupted);
            }
            let state = self.step(Instant::now())?;
            if state != LoopState::Running {
                return Ok(state);
            }
            tokio::select! {
                _ = tokio::time::sleep(POLL_SLEEP) => {}
                _ = cancel.cancelled() => {}
            }
        }
    }

    /// Runs until the job finishes or `cancel` fires. The terminal is restored
    /// on every way out, errors included.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<LoopState, Error> {
        self.screen.begin()?;
        let state = match self.spin(cancel).await {
            Ok(state) => state,
            Err(e) => {
                if let Err(restore) = self.screen.restore() {
                    log::warn!("Failed to restore the terminal: {}", restore);
                }
                return Err(e.into());
            }
        };
        if let Some(msg) = state.farewell() {
            self.screen.finish(msg)?;
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StatusSnapshot;
    use crate::glyphs::GlyphProfile;
    use crate::job::JobDescriptor;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::rc::Rc;
    use std::path::Path;

    struct Handle {
        rate: Cell<f64>,
    }

    impl JobHandle for Handle {
        fn status(&self) -> StatusSnapshot {
            StatusSnapshot {
                download_rate: self.rate.get(),
                name: "fake".to_string(),
                ..StatusSnapshot::default()
            }
        }

        fn set_sequential(&self, _enabled: bool) {}
    }

    #[derive(Default)]
    struct Scripted {
        batches: VecDeque<Vec<EngineEvent>>,
    }

    impl Session for Scripted {
        type Handle = Handle;

        fn add_job(&mut self, _job: JobDescriptor, _save: &Path) -> Result<Handle, Error> {
            Ok(Handle { rate: Cell::new(0.0) })
        }

        fn drain_events(&mut self) -> Vec<EngineEvent> {
            self.batches.pop_front().unwrap_or_default()
        }
    }

    fn config() -> RenderConfig {
        RenderConfig {
            color: false,
            clear: false,
            glyphs: GlyphProfile::Ascii,
            ..RenderConfig::default()
        }
    }

    #[test]
    fn renders_only_when_interval_elapsed() {
        let mut session = Scripted::default();
        let handle = Handle { rate: Cell::new(100.0) };
        let cfg = config();
        let (mut out, mut err) = (Vec::new(), Vec::new());
        let mut lp = PollLoop::new(&mut session, &handle, &cfg, &mut out, &mut err);

        let t0 = Instant::now();
        assert_eq!(lp.step(t0).unwrap(), LoopState::Running);
        assert_eq!(lp.history().len(), 1);

        lp.step(t0 + Duration::from_millis(50)).unwrap();
        assert_eq!(lp.history().len(), 1);

        lp.step(t0 + Duration::from_millis(130)).unwrap();
        assert_eq!(lp.history().len(), 2);
        drop(lp);

        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.matches("Name: fake").count(), 2);
        assert!(err.is_empty());
    }

    #[test]
    fn errors_are_reported_and_loop_continues() {
        let mut session = Scripted::default();
        session
            .batches
            .push_back(vec![EngineEvent::Error("disk full".to_string())]);
        let handle = Handle { rate: Cell::new(0.0) };
        let cfg = config();
        let (mut out, mut err) = (Vec::new(), Vec::new());
        let mut lp = PollLoop::new(&mut session, &handle, &cfg, &mut out, &mut err);

        assert_eq!(lp.step(Instant::now()).unwrap(), LoopState::Running);
        drop(lp);
        assert_eq!(String::from_utf8(err).unwrap(), "[error] disk full\n");
    }

    #[test]
    fn finished_event_ends_the_loop() {
        let mut session = Scripted::default();
        session.batches.push_back(vec![]);
        session.batches.push_back(vec![EngineEvent::Finished]);
        let handle = Handle { rate: Cell::new(0.0) };
        let cfg = config();
        let (mut out, mut err) = (Vec::new(), Vec::new());
        let mut lp = PollLoop::new(&mut session, &handle, &cfg, &mut out, &mut err);

        let t0 = Instant::now();
        assert_eq!(lp.step(t0).unwrap(), LoopState::Running);
        assert_eq!(lp.step(t0).unwrap(), LoopState::Finished);
    }

    /// Shared buffer that can be told to refuse frames or everything.
    #[derive(Clone, Default)]
    struct Sink {
        buf: Rc<RefCell<Vec<u8>>>,
        refuse_frames: bool,
        refuse_all: bool,
    }

    impl Sink {
        fn text(&self) -> String {
            String::from_utf8(self.buf.borrow().clone()).unwrap()
        }
    }

    impl Write for Sink {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            let is_frame = String::from_utf8_lossy(data).contains("Name: fake");
            if self.refuse_all || (self.refuse_frames && is_frame) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"));
            }
            self.buf.borrow_mut().extend_from_slice(data);
            Ok(data.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            match self.refuse_all {
                true => Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed")),
                false => Ok(()),
            }
        }
    }

    fn full_screen() -> RenderConfig {
        RenderConfig {
            clear: true,
            ..config()
        }
    }

    #[tokio::test]
    async fn broken_error_sink_is_not_fatal() {
        let mut session = Scripted::default();
        session
            .batches
            .push_back(vec![EngineEvent::Error("tracker down".to_string())]);
        session.batches.push_back(vec![EngineEvent::Finished]);
        let handle = Handle { rate: Cell::new(0.0) };
        let cfg = full_screen();
        let out = Sink::default();
        let errors = Sink {
            refuse_all: true,
            ..Sink::default()
        };
        let cancel = CancellationToken::new();

        let state = PollLoop::new(&mut session, &handle, &cfg, out.clone(), errors)
            .run(&cancel)
            .await
            .unwrap();

        assert_eq!(state, LoopState::Finished);
        let text = out.text();
        assert!(text.contains("\x1b[?25l"));
        assert!(text.ends_with("\x1b[?25h[done] Finished.\n"));
    }

    #[tokio::test]
    async fn failed_frame_still_restores_cursor() {
        let mut session = Scripted::default();
        let handle = Handle { rate: Cell::new(0.0) };
        let cfg = full_screen();
        let out = Sink {
            refuse_frames: true,
            ..Sink::default()
        };
        let cancel = CancellationToken::new();

        let mut lp = PollLoop::new(&mut session, &handle, &cfg, out.clone(), Vec::new());
        let err = lp.run(&cancel).await.unwrap_err();
        assert_eq!(err.exit_code(), 1);

        let text = out.text();
        assert!(text.starts_with("\x1b[2J"));
        assert!(text.ends_with("\x1b[?25h"));
        drop(lp);
        assert_eq!(out.text().matches("\x1b[?25h").count(), 1);
    }

    #[test]
    fn farewell_messages() {
        assert_eq!(LoopState::Running.farewell(), None);
        assert_eq!(LoopState::Finished.farewell(), Some("[done] Finished."));
        assert_eq!(LoopState::Interrupted.farewell(), Some("Goodbye."));
    }
}
