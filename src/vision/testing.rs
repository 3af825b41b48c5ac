//! In-process context handler for pool, scheduler and pipeline tests

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::context::{ContextFactory, ContextHandler, ContextRequest, ContextResponse, RegionInput, RegionText};
use super::geometry::ImageSize;
use super::heatmap::Heatmap;
use super::resources::MemorySnapshot;

/// Shared script controlling every mock context
///
/// Region tasks are labelled by the box id of their first crop. A gated
/// label blocks its context until the gate is released or dropped.
#[derive(Clone, Default)]
pub struct Script {
    gates: Arc<Mutex<HashMap<usize, Receiver<()>>>>,
    failing: Arc<Mutex<HashSet<usize>>>,
    started: Arc<Mutex<Vec<usize>>>,
    inits: Arc<AtomicUsize>,
    fail_init: bool,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_init() -> Self {
        Self {
            fail_init: true,
            ..Self::default()
        }
    }

    /// Block the task labelled `label` until the returned sender fires
    pub fn gate(&self, label: usize) -> Sender<()> {
        let (tx, rx) = bounded(1);
        self.gates.lock().insert(label, rx);
        tx
    }

    /// Make the task labelled `label` answer with an error
    pub fn fail(&self, label: usize) {
        self.failing.lock().insert(label);
    }

    pub fn started(&self) -> Vec<usize> {
        self.started.lock().clone()
    }

    pub fn inits(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    /// Poll until at least `count` region tasks have started
    pub fn wait_started(&self, count: usize) -> Vec<usize> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            let started = self.started();
            if started.len() >= count {
                return started;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        self.started()
    }

    /// Poll until at least `count` init handshakes have run
    pub fn wait_inits(&self, count: usize) -> usize {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline && self.inits() < count {
            std::thread::sleep(Duration::from_millis(2));
        }
        self.inits()
    }

    pub fn factory(&self) -> Arc<dyn ContextFactory> {
        Arc::new(self.clone())
    }
}

impl ContextFactory for Script {
    fn create(&self, _index: usize) -> Box<dyn ContextHandler> {
        Box::new(MockContext { script: self.clone() })
    }
}

/// Detection marks bright pixels; recognition answers "w<box id>"
struct MockContext {
    script: Script,
}

impl ContextHandler for MockContext {
    fn handle(&mut self, request: ContextRequest) -> ContextResponse {
        match request {
            ContextRequest::Init => {
                self.script.inits.fetch_add(1, Ordering::SeqCst);
                if self.script.fail_init {
                    ContextResponse::Error {
                        message: "model file missing".into(),
                    }
                } else {
                    ContextResponse::Initialized
                }
            }
            ContextRequest::Detect { image } => {
                let size = ImageSize::new(image.width(), image.height());
                let data = image
                    .pixels()
                    .map(|p| if p.0[0] > 127 { 0.9 } else { 0.0 })
                    .collect();
                ContextResponse::DetectComplete {
                    heatmap: Heatmap::new(data, size),
                }
            }
            ContextRequest::ProcessRegion { crops } => self.region(crops),
            ContextRequest::GetMemoryInfo => ContextResponse::MemoryInfo(MemorySnapshot {
                live_buffers: 1,
                live_bytes: 64,
                peak_bytes: 128,
                total_allocations: 3,
            }),
        }
    }
}

impl MockContext {
    fn region(&self, crops: Vec<RegionInput>) -> ContextResponse {
        let label = crops.first().map(|c| c.box_id).unwrap_or_default();
        self.script.started.lock().push(label);

        let gate = self.script.gates.lock().remove(&label);
        if let Some(gate) = gate {
            let _ = gate.recv();
        }

        if self.script.failing.lock().contains(&label) {
            return ContextResponse::Error {
                message: format!("recognition failed for {}", label),
            };
        }

        ContextResponse::RegionComplete {
            texts: crops
                .iter()
                .map(|c| RegionText {
                    box_id: c.box_id,
                    text: format!("w{}", c.box_id),
                })
                .collect(),
        }
    }
}

/// Region request labelled `label` carrying one blank crop
pub fn region_request(label: usize) -> ContextRequest {
    ContextRequest::ProcessRegion {
        crops: vec![RegionInput {
            box_id: label,
            buffer: image::RgbImage::new(4, 4),
        }],
    }
}
