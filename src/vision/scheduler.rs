//! Recognition batch scheduling
//!
//! Splits crops into device-sized batches, feeds them to the execution pool
//! and maps decoded text back to boxes by id.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::context::{ContextRequest, ContextResponse, RegionInput};
use super::crop::Crop;
use super::error::{VisionError, VisionResult};
use super::geometry::PixelBox;
use super::pool::{ExecutionPool, TaskHandle};
use super::resources::{ByteSize, DeviceProfile, MemoryPressure, ResourceGovernor, Tracked};

/// Recognized text for one box
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedWord {
    pub word: String,
    pub bounding_box: PixelBox,
    pub box_id: usize,
}

/// Split `items` into consecutive chunks of at most `batch_size`
pub fn partition<T>(items: Vec<T>, batch_size: usize) -> Vec<Vec<T>> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::with_capacity(items.len().div_ceil(batch_size));
    let mut current = Vec::with_capacity(batch_size.min(items.len()));

    for item in items {
        current.push(item);
        if current.len() == batch_size {
            batches.push(std::mem::replace(&mut current, Vec::with_capacity(batch_size)));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Bytes a batch holds while it is in flight
struct InFlightLoad(usize);

impl ByteSize for InFlightLoad {
    fn byte_size(&self) -> usize {
        self.0
    }
}

/// A submitted batch awaiting its result
struct Submitted {
    index: usize,
    boxes: HashMap<usize, PixelBox>,
    order: Vec<usize>,
    handle: TaskHandle,
    _load: Tracked<InFlightLoad>,
}

/// Drives recognition of all crops of one extraction
pub struct BatchScheduler<'a> {
    pool: &'a ExecutionPool,
    governor: &'a ResourceGovernor,
    idle_tick: Duration,
}

impl<'a> BatchScheduler<'a> {
    pub fn new(pool: &'a ExecutionPool, governor: &'a ResourceGovernor, idle_tick: Duration) -> Self {
        Self {
            pool,
            governor,
            idle_tick,
        }
    }

    /// Recognize every crop and return words in batch submission order
    ///
    /// Constrained devices run one batch at a time with an idle tick in
    /// between; otherwise batches are queued on the pool together unless the
    /// memory ceiling forces a flush. Failed batches are dropped; a timeout
    /// or a terminated pool ends the whole run.
    pub fn run_recognition(
        &self,
        crops: Vec<Crop>,
        profile: &DeviceProfile,
        deadline: Instant,
    ) -> VisionResult<Vec<DecodedWord>> {
        if crops.is_empty() {
            return Ok(Vec::new());
        }

        let batches = partition(crops, profile.batch_size);
        let total = batches.len();
        info!("Recognizing in {} batches of up to {}", total, profile.batch_size);

        let mut words = Vec::new();
        let mut in_flight: Vec<Submitted> = Vec::new();

        for (index, batch) in batches.into_iter().enumerate() {
            if profile.is_constrained {
                if index > 0 {
                    std::thread::sleep(self.idle_tick);
                }
            } else if self.governor.check() == MemoryPressure::Exceeded {
                debug!("Flushing {} in-flight batches before batch {}", in_flight.len(), index);
                self.collect(in_flight.drain(..), deadline, &mut words)?;
            }

            in_flight.push(self.submit(index, batch)?);

            if profile.is_constrained {
                self.collect(in_flight.drain(..), deadline, &mut words)?;
            }
        }

        self.collect(in_flight.drain(..), deadline, &mut words)?;
        info!("Recognized {} words from {} batches", words.len(), total);
        Ok(words)
    }

    fn submit(&self, index: usize, batch: Vec<Crop>) -> VisionResult<Submitted> {
        let mut boxes = HashMap::with_capacity(batch.len());
        let mut order = Vec::with_capacity(batch.len());
        let mut bytes = 0;

        let inputs: Vec<RegionInput> = batch
            .into_iter()
            .map(|crop| {
                let box_id = crop.box_id();
                boxes.insert(box_id, crop.pixel_bbox);
                order.push(box_id);
                bytes += crop.buffer.byte_size();
                RegionInput {
                    box_id,
                    buffer: crop.buffer,
                }
            })
            .collect();

        let load = self.governor.arena().track(InFlightLoad(bytes));
        let handle = self.pool.submit(ContextRequest::ProcessRegion { crops: inputs })?;
        debug!("Submitted batch {} ({} crops) as task {}", index, order.len(), handle.id());

        Ok(Submitted {
            index,
            boxes,
            order,
            handle,
            _load: load,
        })
    }

    /// Await batches in submission order, dropping recoverable failures
    fn collect(
        &self,
        submitted: impl Iterator<Item = Submitted>,
        deadline: Instant,
        words: &mut Vec<DecodedWord>,
    ) -> VisionResult<()> {
        for batch in submitted {
            let Submitted {
                index,
                boxes,
                order,
                handle,
                _load,
            } = batch;

            match handle.wait_until(deadline) {
                Ok(ContextResponse::RegionComplete { texts }) => {
                    let mut decoded: HashMap<usize, String> =
                        texts.into_iter().map(|t| (t.box_id, t.text)).collect();
                    for box_id in order {
                        let Some(word) = decoded.remove(&box_id) else {
                            warn!("Batch {} returned no text for box {}", index, box_id);
                            continue;
                        };
                        if word.is_empty() {
                            continue;
                        }
                        if let Some(&bounding_box) = boxes.get(&box_id) {
                            words.push(DecodedWord {
                                word,
                                bounding_box,
                                box_id,
                            });
                        }
                    }
                    for box_id in decoded.keys() {
                        warn!("Batch {} returned text for unknown box {}", index, box_id);
                    }
                }
                Ok(other) => {
                    let e = VisionError::BatchProcessing {
                        batch: index,
                        message: format!("unexpected {} response", other.message_type()),
                    };
                    warn!("{}", e);
                }
                Err(e) if e.is_recoverable() => {
                    let e = VisionError::BatchProcessing {
                        batch: index,
                        message: e.to_string(),
                    };
                    warn!("Dropping words: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceSettings;
    use crate::vision::geometry::{BoundingBox, BoxStyle};
    use crate::vision::pool::PoolConfig;
    use crate::vision::resources::MemoryCeiling;
    use crate::vision::testing::Script;
    use image::RgbImage;

    fn crop(id: usize) -> Crop {
        Crop {
            buffer: RgbImage::new(128, 32),
            source_box: BoundingBox {
                id,
                corners: [(0.0, 0.0), (0.1, 0.0), (0.1, 0.1), (0.0, 0.1)],
                style: BoxStyle::for_id(id),
            },
            pixel_bbox: PixelBox {
                x: id as i64,
                y: 0,
                width: 10,
                height: 5,
            },
        }
    }

    fn profile(is_constrained: bool, batch_size: usize) -> DeviceProfile {
        DeviceProfile {
            max_dimension: 4096,
            batch_size,
            is_constrained,
            parallelism: 2,
        }
    }

    fn governor(profile: DeviceProfile) -> ResourceGovernor {
        let ceiling = MemoryCeiling::for_profile(&profile, &DeviceSettings::default());
        ResourceGovernor::new(profile, ceiling)
    }

    fn pool(script: &Script, size: usize) -> ExecutionPool {
        let config = PoolConfig {
            size,
            task_timeout: Duration::from_secs(5),
            init_timeout: Duration::from_secs(5),
        };
        ExecutionPool::start(script.factory(), config).unwrap()
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(10)
    }

    #[test]
    fn test_partition_sizes() {
        let batches = partition((0..70).collect::<Vec<_>>(), 16);
        let sizes: Vec<usize> = batches.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![16, 16, 16, 16, 6]);
        assert_eq!(batches[4], (64..70).collect::<Vec<_>>());
    }

    #[test]
    fn test_partition_edges() {
        assert!(partition(Vec::<u8>::new(), 4).is_empty());
        assert_eq!(partition(vec![1, 2, 3, 4], 4).len(), 1);
        assert_eq!(partition(vec![1, 2, 3], 0).len(), 3);
    }

    #[test]
    fn test_words_follow_submission_order() {
        let script = Script::new();
        let pool = pool(&script, 2);
        let profile = profile(false, 4);
        let governor = governor(profile);
        let scheduler = BatchScheduler::new(&pool, &governor, Duration::ZERO);

        // reverse-of-discovery ids, as the extractor emits them
        let crops: Vec<Crop> = (0..10).rev().map(crop).collect();
        let words = scheduler.run_recognition(crops, &profile, deadline()).unwrap();

        let ids: Vec<usize> = words.iter().map(|w| w.box_id).collect();
        assert_eq!(ids, (0..10).rev().collect::<Vec<_>>());
        for w in &words {
            assert_eq!(w.word, format!("w{}", w.box_id));
            assert_eq!(w.bounding_box.x, w.box_id as i64);
        }
    }

    #[test]
    fn test_failed_batch_is_dropped() {
        let script = Script::new();
        // second batch starts with box 4
        script.fail(4);
        let pool = pool(&script, 2);
        let profile = profile(false, 4);
        let governor = governor(profile);
        let scheduler = BatchScheduler::new(&pool, &governor, Duration::ZERO);

        let words = scheduler
            .run_recognition((0..10).map(crop).collect(), &profile, deadline())
            .unwrap();
        let ids: Vec<usize> = words.iter().map(|w| w.box_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 8, 9]);
    }

    #[test]
    fn test_constrained_runs_sequentially() {
        let script = Script::new();
        let pool = pool(&script, 3);
        let profile = profile(true, 4);
        let governor = governor(profile);
        let scheduler = BatchScheduler::new(&pool, &governor, Duration::from_millis(1));

        let words = scheduler
            .run_recognition((0..9).map(crop).collect(), &profile, deadline())
            .unwrap();
        assert_eq!(words.len(), 9);
        assert_eq!(script.started(), vec![0, 4, 8]);
        assert_eq!(governor.arena().snapshot().live_buffers, 0);
    }

    #[test]
    fn test_memory_ceiling_forces_flush() {
        let script = Script::new();
        let pool = pool(&script, 2);
        let profile = profile(false, 2);
        let governor = ResourceGovernor::new(
            profile,
            MemoryCeiling {
                max_buffers: 0,
                max_bytes: usize::MAX,
            },
        );
        let scheduler = BatchScheduler::new(&pool, &governor, Duration::ZERO);

        let words = scheduler
            .run_recognition((0..6).map(crop).collect(), &profile, deadline())
            .unwrap();
        assert_eq!(words.len(), 6);
        assert_eq!(governor.arena().snapshot().peak_bytes, 2 * 128 * 32 * 3);
        assert_eq!(governor.arena().snapshot().live_buffers, 0);
    }

    #[test]
    fn test_deadline_is_terminal() {
        let script = Script::new();
        let pool = pool(&script, 1);
        let _gate = script.gate(0);
        let profile = profile(false, 4);
        let governor = governor(profile);
        let scheduler = BatchScheduler::new(&pool, &governor, Duration::ZERO);

        let result = scheduler.run_recognition(
            (0..4).map(crop).collect(),
            &profile,
            Instant::now() + Duration::from_millis(50),
        );
        assert!(matches!(result, Err(VisionError::ContextTimeout(_))));
    }

    #[test]
    fn test_empty_input() {
        let script = Script::new();
        let pool = pool(&script, 1);
        let profile = profile(false, 4);
        let governor = governor(profile);
        let scheduler = BatchScheduler::new(&pool, &governor, Duration::ZERO);

        let words = scheduler.run_recognition(Vec::new(), &profile, deadline()).unwrap();
        assert!(words.is_empty());
        assert!(script.started().is_empty());
    }
}
