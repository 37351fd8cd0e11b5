use std::{collections::VecDeque, sync::Arc, time::Duration};

use anyhow::Result;
use log::debug;
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time::sleep,
};

use crate::{
    lifecycle::{used_after_stop, Lifecycle},
    storage::{MetadataStore, StatusUpdate},
};

const SLIDING_WINDOW: usize = 10;
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Per-tick byte counts of one direction over the last [`SLIDING_WINDOW`] ticks.
#[derive(Default)]
pub struct SpeedWindow {
    samples: VecDeque<u64>,
    pending: u64,
    total: u64,
}

impl SpeedWindow {
    pub fn observe(&mut self, bytes: u64) {
        self.pending += bytes;
    }

    /// Closes the current tick and returns the new average in bytes per tick.
    pub fn tick(&mut self) -> f64 {
        self.samples.push_back(self.pending);
        if self.samples.len() > SLIDING_WINDOW {
            self.samples.pop_front();
        }

        self.total += self.pending;
        self.pending = 0;

        self.average()
    }

    /// Idle ticks do not count towards the denominator.
    pub fn average(&self) -> f64 {
        let active = self.samples.iter().filter(|s| **s > 0).count();
        if active == 0 {
            return 0.0;
        }

        let sum: u64 = self.samples.iter().sum();
        sum as f64 / active as f64
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

pub enum Command {
    Upload(u64),
    Download(u64),
    Tick,
    Stop,
}

#[derive(Clone)]
pub struct SpeedHandle {
    tx: UnboundedSender<Command>,
}

impl SpeedHandle {
    pub fn observe_upload(&self, bytes: usize) {
        self.record(Command::Upload(bytes as u64));
    }

    pub fn observe_download(&self, bytes: usize) {
        self.record(Command::Download(bytes as u64));
    }

    pub fn stop(&self) {
        self.dispatch(Command::Stop);
    }

    fn dispatch(&self, command: Command) {
        if self.tx.send(command).is_err() {
            used_after_stop("speed calculator");
        }
    }

    /// Traffic drained by connections during teardown may still be reported
    /// after the calculator stopped.
    fn record(&self, command: Command) {
        if self.tx.send(command).is_err() {
            debug!("Dropping traffic sample, speed calculator stopped. ");
        }
    }
}

pub struct SpeedCalculator {
    upload: SpeedWindow,
    download: SpeedWindow,
    tick_scheduled: bool,
    lifecycle: Lifecycle,
    metadata: Option<Arc<dyn MetadataStore>>,
    tx: UnboundedSender<Command>,
    rx: UnboundedReceiver<Command>,
}

impl SpeedCalculator {
    pub fn new(metadata: Option<Arc<dyn MetadataStore>>) -> (Self, SpeedHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SpeedHandle { tx: tx.clone() };

        let calculator = Self {
            upload: SpeedWindow::default(),
            download: SpeedWindow::default(),
            tick_scheduled: false,
            lifecycle: Lifecycle::Uninitialized,
            metadata,
            tx,
            rx,
        };

        (calculator, handle)
    }

    pub async fn start(mut self) -> Result<()> {
        self.lifecycle = Lifecycle::Running;

        while let Some(command) = self.rx.recv().await {
            self.handle(command);
            if !self.lifecycle.is_running() {
                break;
            }
        }

        Ok(())
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Upload(bytes) => {
                self.upload.observe(bytes);
                self.schedule_tick();
            },
            Command::Download(bytes) => {
                self.download.observe(bytes);
                self.schedule_tick();
            },
            Command::Tick => self.tick(),
            Command::Stop => self.lifecycle = Lifecycle::Stopped,
        }
    }

    fn schedule_tick(&mut self) {
        if self.tick_scheduled {
            return;
        }

        self.tick_scheduled = true;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            sleep(TICK_INTERVAL).await;
            let _ = tx.send(Command::Tick);
        });
    }

    fn tick(&mut self) {
        self.tick_scheduled = false;

        let upload = self.upload.tick();
        let download = self.download.tick();

        if let Some(metadata) = &self.metadata {
            metadata.update_status(StatusUpdate::Throughput {
                upload,
                download,
                total_upload: self.upload.total(),
                total_download: self.download.total(),
            });
        }

        if upload == 0.0 && download == 0.0 {
            debug!("Transfer idle, pausing speed updates. ");
            return;
        }

        self.schedule_tick();
    }
}
