use std::{sync::Mutex, thread, time::Duration};

use anyhow::{anyhow, Context, Result};
use rand::{rngs::StdRng, seq::SliceRandom};
use rayon::prelude::*;
use tracing::{info, warn};

use crate::{
    client::{Client, JoinedRow, SaltCoordinator},
    config::SimulationConfig,
    crypto::KeyMaterial,
    engine::{EngineConfig, JoinEngine},
    holder::{DataHolder, HolderStats},
    message::{decode, encode, ComputeRequest, ResultFragment},
    relation::Relation,
    traits::{RelationStore, SaltExchange},
    utils::rng_from,
    verify::{RunStats, Verdict, ViolationReport},
    HOLDER_L, HOLDER_R,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Verified(Vec<JoinedRow>),
    Violation(ViolationReport),
    Tampering(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub run: usize,
    pub outcome: RunOutcome,
    // whole run, keys to completed rows
    pub elapsed_ms: u64,
    pub holder_l: HolderStats,
    pub holder_r: HolderStats,
    pub stats: RunStats,
}

/// Everything one simulated deployment needs, owned in one place: two data
/// holders, the computation layer and the client.
pub struct Session<S: RelationStore = Relation> {
    config: SimulationConfig,
    holder_l: DataHolder<S>,
    holder_r: DataHolder<S>,
    engine: Mutex<JoinEngine>,
    client: Client,
    rng: StdRng,
    runs: usize,
}

impl<S: RelationStore> Session<S> {
    pub fn new(config: SimulationConfig, left: S, right: S) -> Result<Self> {
        config.validate()?;
        let timeout = Duration::from_millis(config.salt_timeout_ms);
        Ok(Self {
            holder_l: DataHolder::new(HOLDER_L, left, timeout),
            holder_r: DataHolder::new(HOLDER_R, right, timeout),
            engine: Mutex::new(JoinEngine::new(EngineConfig::from(&config))),
            client: Client::new(config.client.clone()),
            rng: rng_from(config.seed),
            runs: 0,
            config,
        })
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// One query run with fresh keys. Engine faults abort the run with an
    /// error; verification failures are reported in the outcome.
    pub fn run_query(&mut self) -> Result<RunReport> {
        let run = self.runs;
        self.runs += 1;
        let timer = howlong::ProcessCPUTimer::new();
        let keys = KeyMaterial::generate(&mut self.rng);
        let request_l = self.client.build_request(HOLDER_L, &keys);
        let request_r = self.client.build_request(HOLDER_R, &keys);
        let verifier = self.client.verifier(&keys);
        let coordinator = SaltCoordinator::new(&[HOLDER_L, HOLDER_R]);
        info!(run, workers = request_l.num_workers(), "query run started");

        let engine = &self.engine;
        let exchange: &dyn SaltExchange = &coordinator;
        let holder_l = &mut self.holder_l;
        let holder_r = &mut self.holder_r;
        let (sent_l, sent_r) = thread::scope(|s| {
            let hl = s.spawn(move || -> Result<Sent> {
                let (request, stats) = holder_l.handle_query(&request_l, Some(exchange))?;
                Ok((send(engine, &request)?, stats))
            });
            let hr = s.spawn(move || -> Result<Sent> {
                let (request, stats) = holder_r.handle_query(&request_r, Some(exchange))?;
                Ok((send(engine, &request)?, stats))
            });
            (join_holder(hl.join()), join_holder(hr.join()))
        });
        let ((sent_l, stats_l), (sent_r, stats_r)) = (sent_l?, sent_r?);
        let fragments = match (sent_l, sent_r) {
            (Some(f), None) | (None, Some(f)) => f,
            _ => return Err(anyhow!("computation layer produced no result")),
        };

        // fragments travel independently and may arrive in any order
        let mut wire = fragments
            .iter()
            .map(encode::<ResultFragment>)
            .collect::<Result<Vec<Vec<u8>>>>()?;
        wire.shuffle(&mut self.rng);
        let verdicts = wire
            .par_iter()
            .map(|bytes| decode::<ResultFragment>(bytes).map(|f| verifier.on_fragment(f)))
            .collect::<Result<Vec<Verdict>>>()?;
        let verdict = verdicts
            .into_iter()
            .find(Verdict::is_complete)
            .ok_or_else(|| anyhow!("result fragments did not complete"))?;

        let (outcome, stats) = match verdict {
            Verdict::Verified(res) => {
                let rows = self
                    .client
                    .complete(&res.rows, &self.holder_l, &self.holder_r)
                    .context("join completion failed")?;
                (RunOutcome::Verified(rows), res.stats)
            }
            Verdict::Violation(v) => {
                warn!(run, "run flagged as integrity violation");
                let stats = v.stats;
                (RunOutcome::Violation(v), stats)
            }
            Verdict::Tampering { reason, stats } => {
                warn!(run, reason = %reason, "run flagged as tampered");
                (RunOutcome::Tampering(reason), stats)
            }
            Verdict::Incomplete => return Err(anyhow!("verifier reported an incomplete result")),
        };
        let elapsed_ms = timer.elapsed().real.as_millis() as u64;
        info!(run, rows = stats.result_rows, elapsed_ms, "query run finished");
        Ok(RunReport {
            run,
            outcome,
            elapsed_ms,
            holder_l: stats_l,
            holder_r: stats_r,
            stats,
        })
    }
}

type Sent = (Option<Vec<ResultFragment>>, HolderStats);

// holder -> computation layer, through the wire codec
fn send(engine: &Mutex<JoinEngine>, request: &ComputeRequest) -> Result<Option<Vec<ResultFragment>>> {
    let bytes = encode(request)?;
    let request: ComputeRequest = decode(&bytes)?;
    let mut engine = engine
        .lock()
        .map_err(|_| anyhow!("computation layer lock poisoned"))?;
    Ok(engine.submit(request)?)
}

fn join_holder(res: thread::Result<Result<Sent>>) -> Result<Sent> {
    res.map_err(|_| anyhow!("data holder thread panicked"))?
}
