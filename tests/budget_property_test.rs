//! 预算性质：无论各单元耗时如何，一次调用都在 D - safety_margin 之前返回，
//! 且没有任何单元在剩余时间不足最短尝试时长时开始

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use tokio::time::Instant;

use common::{engine, test_config, tool_call, TimedAssembler};
use relay::core::JobRequest;
use relay::react::{Decision, Reasoner, ReasoningInput};
use relay::tools::Tool;

const MARGIN_MS: u64 = 1_500;
const ATTEMPT_TIMEOUT_MS: u64 = 2_000;
const MIN_ATTEMPT_MS: u64 = 500;

/// 记录每个单元开始的时刻
#[derive(Clone, Default)]
struct Stamps(Arc<Mutex<Vec<Instant>>>);

impl Stamps {
    fn push(&self) {
        self.0.lock().unwrap().push(Instant::now());
    }

    fn take(&self) -> Vec<Instant> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

struct RandomReasoner {
    delays: Mutex<StdRng>,
    stamps: Stamps,
}

#[async_trait]
impl Reasoner for RandomReasoner {
    async fn reason(&self, _input: &ReasoningInput<'_>) -> Result<Decision, String> {
        self.stamps.push();
        let ms = self.delays.lock().unwrap().gen_range(100..1_800);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(tool_call("sampler"))
    }
}

struct RandomTool {
    delays: Mutex<StdRng>,
    stamps: Stamps,
}

#[async_trait]
impl Tool for RandomTool {
    fn name(&self) -> &str {
        "sampler"
    }

    fn description(&self) -> &str {
        "sleeps for a random while"
    }

    async fn execute(&self, _args: Value) -> Result<String, String> {
        self.stamps.push();
        let ms = self.delays.lock().unwrap().gen_range(50..1_500);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(format!("sampled in {ms}ms"))
    }
}

#[tokio::test(start_paused = true)]
async fn test_invocations_never_overrun_the_deadline() {
    for seed in 0..40u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut cfg = test_config();
        cfg.engine.safety_margin_ms = MARGIN_MS;
        cfg.engine.heartbeat_interval_ms = 0;
        cfg.engine.max_iterations = 1_000;
        cfg.tools.per_tool_timeout_ms = ATTEMPT_TIMEOUT_MS;
        cfg.tools.min_attempt_ms = MIN_ATTEMPT_MS;

        let stamps = Stamps::default();
        let reasoner = Arc::new(RandomReasoner {
            delays: Mutex::new(StdRng::seed_from_u64(seed + 1_000)),
            stamps: stamps.clone(),
        });
        let tool = Arc::new(RandomTool {
            delays: Mutex::new(StdRng::seed_from_u64(seed + 2_000)),
            stamps: stamps.clone(),
        });
        let assembler = Arc::new(TimedAssembler::new(vec![Duration::from_millis(
            rng.gen_range(0..8_000),
        )]));
        let e = engine(cfg, reasoner, assembler, vec![tool as Arc<dyn Tool>]).await;

        let mut job_id: Option<String> = None;
        for _ in 0..3 {
            let window = Duration::from_millis(rng.gen_range(4_000..30_000));
            let started = Instant::now();
            let stop = started + window - Duration::from_millis(MARGIN_MS);
            let deadline = e.deadline_in(window);

            let out = match &job_id {
                Some(id) => e.orchestrator.resume(id, deadline).await.unwrap(),
                None => e
                    .orchestrator
                    .start(JobRequest::new("sensor-1", "keep sampling"), deadline)
                    .await
                    .unwrap(),
            };
            assert!(!out.is_terminal(), "seed {seed}: job should only pause");
            assert!(Instant::now() <= stop, "seed {seed}: returned after D - margin");
            for at in stamps.take() {
                assert!(
                    at + Duration::from_millis(MIN_ATTEMPT_MS) <= stop,
                    "seed {seed}: a unit started below the attempt floor"
                );
            }
            job_id = Some(out.job_id().to_string());
        }
    }
}
