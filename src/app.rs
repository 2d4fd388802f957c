//! Headless application shell.
//!
//! [`SensorStreamer`] is the sensor device: it owns the Link Manager, feeds
//! fused rotation matrices to the peer while connected and restarts the link
//! after a session ends. [`Monitor`] is the reference peer that decodes the
//! stream.

use crate::domain::models::{
    LinkEvent, MessageSeverity, PeerIdentity, Role, SessionState, StartOutcome, StatusMessage,
};
use crate::domain::orientation::{RotationMatrix, SensorFusion, SimulatedImu};
use crate::domain::settings::SettingsService;
use crate::infrastructure::link::manager::{LinkConfig, LinkManager};
use crate::infrastructure::link::protocol::{encode_rotation_frame, FrameAssembler};
use crate::infrastructure::link::transport::Transport;
use anyhow::Context;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// How often the shell loops poll for events
const POLL_INTERVAL: Duration = Duration::from_millis(10);

const MONITOR_RESTART_DELAY: Duration = Duration::from_secs(1);

fn log_notice(msg: &StatusMessage) {
    match msg.severity {
        MessageSeverity::Error => error!("{}", msg.message),
        MessageSeverity::Warning => warn!("{}", msg.message),
        MessageSeverity::Info | MessageSeverity::Success => info!("{}", msg.message),
    }
}

pub struct SensorStreamer {
    settings: SettingsService,
    role: Role,
    link: LinkManager,
    events: mpsc::UnboundedReceiver<LinkEvent>,

    // Sensors
    imu: SimulatedImu,
    fusion: SensorFusion,
    sensors_registered: bool,
    next_sample: Instant,
    frames_sent: u64,

    // Status
    status: String,
    status_message: Option<StatusMessage>,

    // Restart
    auto_restart: bool,
    restart_timer: Option<Instant>,
}

impl SensorStreamer {
    pub fn new(
        settings: SettingsService,
        transport: Arc<dyn Transport>,
        role: Role,
    ) -> anyhow::Result<Self> {
        let (link, events) = LinkManager::new(transport, settings.get().link.link_config())
            .context("Failed to start the link manager")?;
        let imu = SimulatedImu::new(settings.get().sensor.simulated_yaw_deg_per_sec);
        let auto_restart = settings.get().link.auto_restart;

        Ok(Self {
            settings,
            role,
            link,
            events,
            imu,
            fusion: SensorFusion::new(),
            sensors_registered: false,
            next_sample: Instant::now(),
            frames_sent: 0,
            status: "Not connected".to_string(),
            status_message: None,
            auto_restart,
            restart_timer: None,
        })
    }

    /// Start the link. Failing to bring up the transport is fatal.
    pub fn start(&mut self) -> anyhow::Result<()> {
        match self.link.start(self.role.clone())? {
            StartOutcome::Started => debug!("Link started as {:?}", self.role),
            StartOutcome::AlreadyActive(state) => debug!("Link already {}", state),
        }
        Ok(())
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn status_message(&self) -> Option<&StatusMessage> {
        self.status_message.as_ref()
    }

    pub fn link_state(&self) -> SessionState {
        self.link.state()
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn sensors_registered(&self) -> bool {
        self.sensors_registered
    }

    pub fn settings(&self) -> &SettingsService {
        &self.settings
    }

    /// One iteration of the shell loop.
    pub fn tick(&mut self, now: Instant) {
        if let Some(time) = self.restart_timer {
            if now >= time {
                self.restart_timer = None;
                if self.link.state() == SessionState::Idle {
                    info!("Restarting link");
                    if let Err(e) = self.start() {
                        error!("Restart failed: {:#}", e);
                        self.auto_restart = false;
                    }
                }
            }
        }

        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event, now);
        }

        if self.sensors_registered && now >= self.next_sample {
            self.next_sample = now + self.settings.get().sensor.sample_interval();
            self.sample_and_send();
        }
    }

    pub fn handle_event(&mut self, event: LinkEvent, now: Instant) {
        match event {
            LinkEvent::StateChanged { state, peer } => self.on_state_changed(state, peer, now),
            LinkEvent::PeerIdentified(name) => {
                self.status_message = Some(StatusMessage {
                    message: format!("Connected to {}", name),
                    severity: MessageSeverity::Success,
                });
            }
            LinkEvent::DataReceived(bytes) => {
                info!("Received: {}", String::from_utf8_lossy(&bytes));
            }
            LinkEvent::Notice(msg) => {
                log_notice(&msg);
                // A hard error is left for the user to look at
                if msg.severity == MessageSeverity::Error {
                    self.auto_restart = false;
                    self.restart_timer = None;
                }
                self.status_message = Some(msg);
            }
        }
    }

    fn on_state_changed(&mut self, state: SessionState, peer: Option<PeerIdentity>, now: Instant) {
        match (state, peer) {
            (SessionState::Connected, Some(peer)) => {
                self.status = format!("Connected to {}", peer.display_name());
                self.restart_timer = None;
                if let Err(e) = self.settings.record_peer(&peer.address) {
                    warn!("Failed to remember peer {}: {:#}", peer.address, e);
                }
                self.register_sensors(now);
            }
            (SessionState::Connected, None) => {
                self.status = "Connected".to_string();
                self.register_sensors(now);
            }
            (SessionState::Idle, _) => {
                self.status = "Not connected".to_string();
                self.unregister_sensors();
                if self.auto_restart {
                    let delay = self.settings.get().link.restart_delay();
                    self.restart_timer = Some(now + delay);
                    info!("Link idle, restarting in {:?}", delay);
                }
            }
            (state, _) => {
                self.status = state.to_string();
                self.unregister_sensors();
            }
        }
        info!("Status: {}", self.status);
    }

    fn register_sensors(&mut self, now: Instant) {
        if !self.sensors_registered {
            debug!("Registering sensors");
            self.sensors_registered = true;
            self.fusion.reset();
            self.next_sample = now;
        }
    }

    fn unregister_sensors(&mut self) {
        if self.sensors_registered {
            debug!("Unregistering sensors");
            self.sensors_registered = false;
        }
    }

    fn sample_and_send(&mut self) {
        let interval = self.settings.get().sensor.sample_interval();
        let mut latest = None;
        for reading in self.imu.sample(interval) {
            if let Some(matrix) = self.fusion.update(reading) {
                latest = Some(matrix);
            }
        }

        match latest {
            Some(matrix) => {
                self.link.write(encode_rotation_frame(&matrix));
                self.frames_sent += 1;
            }
            None => debug!("Degenerate sensor reading, nothing sent"),
        }
    }

    /// Run until `shutdown` is set, then stop the link.
    pub fn run(&mut self, shutdown: &AtomicBool) -> anyhow::Result<()> {
        self.start()?;
        while !shutdown.load(Ordering::SeqCst) {
            self.tick(Instant::now());
            std::thread::sleep(POLL_INTERVAL);
        }

        info!("Shutting down after {} frames", self.frames_sent);
        self.link.stop();
        Ok(())
    }
}

/// Reference peer: decodes rotation frames and logs them.
pub struct Monitor {
    role: Role,
    link: LinkManager,
    events: mpsc::UnboundedReceiver<LinkEvent>,
    assembler: FrameAssembler,
    frames_received: u64,
    latest: Option<RotationMatrix>,

    // Restart
    auto_restart: bool,
    restart_timer: Option<Instant>,
}

impl Monitor {
    pub fn new(transport: Arc<dyn Transport>, config: LinkConfig, role: Role) -> anyhow::Result<Self> {
        let (link, events) =
            LinkManager::new(transport, config).context("Failed to start the link manager")?;
        Ok(Self {
            role,
            link,
            events,
            assembler: FrameAssembler::new(),
            frames_received: 0,
            latest: None,
            auto_restart: true,
            restart_timer: None,
        })
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received
    }

    pub fn latest(&self) -> Option<&RotationMatrix> {
        self.latest.as_ref()
    }

    pub fn handle_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::StateChanged { state, peer } => match peer {
                Some(peer) => info!("Link {} ({})", state, peer.display_name()),
                None => info!("Link {}", state),
            },
            LinkEvent::DataReceived(bytes) => {
                for matrix in self.assembler.push(&bytes) {
                    self.frames_received += 1;
                    let m = matrix.as_array();
                    info!(
                        "Frame {}: [{:.3} {:.3} {:.3}] [{:.3} {:.3} {:.3}] [{:.3} {:.3} {:.3}]",
                        self.frames_received, m[0], m[1], m[2], m[4], m[5], m[6], m[8], m[9], m[10]
                    );
                    self.latest = Some(matrix);
                }
            }
            LinkEvent::PeerIdentified(name) => debug!("Peer identified: {}", name),
            LinkEvent::Notice(msg) => log_notice(&msg),
        }
    }

    pub fn link_state(&self) -> SessionState {
        self.link.state()
    }

    /// One iteration of the monitor loop. The link is started again a
    /// moment after it drops back to `Idle`; a failed restart turns that
    /// off, as it does for the streamer.
    pub fn tick(&mut self, now: Instant) {
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event);
        }

        if self.link.state() != SessionState::Idle {
            self.restart_timer = None;
            return;
        }
        if !self.auto_restart {
            return;
        }

        match self.restart_timer {
            None => self.restart_timer = Some(now + MONITOR_RESTART_DELAY),
            Some(at) if now >= at => {
                self.restart_timer = None;
                info!("Restarting link");
                if let Err(e) = self.link.start(self.role.clone()) {
                    error!("Restart failed: {}", e);
                    self.auto_restart = false;
                }
            }
            Some(_) => {}
        }
    }

    /// Run until `shutdown` is set. Failing to bring up the transport the
    /// first time is fatal.
    pub fn run(&mut self, shutdown: &AtomicBool) -> anyhow::Result<()> {
        self.link.start(self.role.clone())?;
        while !shutdown.load(Ordering::SeqCst) {
            self.tick(Instant::now());
            std::thread::sleep(POLL_INTERVAL);
        }

        if self.assembler.skipped_bytes() > 0 {
            warn!("Skipped {} unframed bytes", self.assembler.skipped_bytes());
        }
        self.link.stop();
        Ok(())
    }
}
