//! Per-batch pipeline orchestration.
//!
//! Each ticket walks `spam -> pii -> (llm ‖ geocode) -> priority`; spam
//! short-circuits the rest. Routing runs once per batch, after every
//! ticket has a priority (or has terminally failed), because lowest-load
//! selection needs a stable priority ordering. Cross-ticket parallelism
//! is bounded by per-stage semaphores.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use super::{
    CancelHandle, CancelToken, ProgressStore, StageOutput, StagePolicy, StageResult, StageRunner,
    cancel_pair,
};
use crate::config::{FlowConfig, Secrets};
use crate::domain::{
    Analysis, Assignment, Batch, BatchStatus, GeoPoint, Segment, Stage, StageOutcome, StageStatus,
    Ticket, TicketType, Value, payload,
};
use crate::error::{FlowError, Result, StageError};
use crate::event::{EventBus, StageEvent};
use crate::geo::{AddressResolver, AddressStatus, GeoResolution};
use crate::pii::PiiVault;
use crate::ports::{
    AnalysisRequest, GeocoderPort, HttpGeocoder, HttpSpamClassifier, LlmAnalysis, LlmPort,
    OpenRouterLlm, SpamClassifierPort,
};
use crate::priority::{PriorityInput, PriorityScorer};
use crate::routing::{LoadLedger, RouteRequest, RoutingEngine};
use crate::spam::SpamFilter;

/// The external collaborators the pipeline talks to.
pub struct PipelinePorts {
    pub llm: Arc<dyn LlmPort>,
    pub geocoder: Arc<dyn GeocoderPort>,
    pub spam: Arc<dyn SpamClassifierPort>,
}

/// Agents and offices available for routing.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    pub agents: Vec<crate::domain::Agent>,
    pub offices: Vec<crate::domain::Office>,
}

/// Per-ticket outcome surfaced in batch results and progress snapshots.
#[derive(Debug, Clone)]
pub struct TicketResult {
    pub ticket_id: Uuid,
    pub row_index: usize,
    pub segment: Segment,
    pub is_spam: bool,
    pub spam_probability: Option<f64>,
    pub coordinates: Option<GeoPoint>,
    pub address_status: String,
    pub analysis: Option<Analysis>,
    pub assignment: Option<Assignment>,
    pub routing_failure: Option<String>,
    pub failed_stages: Vec<Stage>,
}

impl TicketResult {
    fn new(ticket: &Ticket) -> Self {
        Self {
            ticket_id: ticket.id,
            row_index: ticket.row_index,
            segment: ticket.segment,
            is_spam: false,
            spam_probability: None,
            coordinates: None,
            address_status: "unknown".to_string(),
            analysis: None,
            assignment: None,
            routing_failure: None,
            failed_stages: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub status: BatchStatus,
    pub total: usize,
    pub spam: usize,
    pub enriched: usize,
    pub routed: usize,
    pub failed: usize,
    pub results: Vec<TicketResult>,
}

/// Point-in-time view for external pollers.
#[derive(Debug, Clone)]
pub struct ProgressReport {
    pub batch_id: Uuid,
    pub total: usize,
    pub processed: usize,
    pub spam: usize,
    pub current: usize,
    pub status: BatchStatus,
    pub results: Vec<TicketResult>,
}

struct ProgressInner {
    total: usize,
    processed: usize,
    spam: usize,
    current: usize,
    status: BatchStatus,
    results: Vec<TicketResult>,
}

struct BatchState {
    handle: CancelHandle,
    token: CancelToken,
    progress: Mutex<ProgressInner>,
}

pub struct Orchestrator {
    config: FlowConfig,
    bus: Arc<EventBus>,
    runner: StageRunner,
    vault: Arc<PiiVault>,
    resolver: Arc<AddressResolver>,
    spam_filter: Arc<SpamFilter>,
    scorer: PriorityScorer,
    router: RoutingEngine,
    llm: Arc<dyn LlmPort>,
    llm_permits: Arc<Semaphore>,
    geocode_permits: Arc<Semaphore>,
    batches: RwLock<HashMap<Uuid, Arc<BatchState>>>,
}

impl Orchestrator {
    pub fn new(
        config: FlowConfig,
        ports: PipelinePorts,
        store: ProgressStore,
        vault: Arc<PiiVault>,
    ) -> Self {
        let bus = Arc::new(EventBus::new(config.events.queue_capacity));
        let runner = StageRunner::new(store, Arc::clone(&bus), &config.pipeline);
        let resolver = Arc::new(AddressResolver::new(ports.geocoder, config.geo.clone()));
        let spam_permits = Arc::new(Semaphore::new(config.pipeline.spam_llm_concurrency));
        let spam_filter = Arc::new(
            SpamFilter::new(config.spam.clone(), ports.spam).with_permits(spam_permits),
        );
        let scorer = PriorityScorer::new(config.scoring.clone());
        let router = RoutingEngine::new(config.routing.clone(), Arc::new(LoadLedger::new()));
        let llm_permits = Arc::new(Semaphore::new(config.pipeline.llm_concurrency));
        let geocode_permits = Arc::new(Semaphore::new(config.pipeline.geocode_concurrency));

        Self {
            config,
            bus,
            runner,
            vault,
            resolver,
            spam_filter,
            scorer,
            router,
            llm: ports.llm,
            llm_permits,
            geocode_permits,
            batches: RwLock::new(HashMap::new()),
        }
    }

    /// Wire the default vendor adapters, the on-disk progress store and
    /// the PII vault from environment secrets.
    pub fn from_secrets(config: FlowConfig, secrets: &Secrets) -> Result<Arc<Self>> {
        let store = ProgressStore::open(&secrets.db_path)?;
        let vault = Arc::new(PiiVault::new(&secrets.encryption_key));
        let ports = PipelinePorts {
            llm: Arc::new(OpenRouterLlm::new(secrets.llm_api_key.clone())),
            geocoder: Arc::new(HttpGeocoder::new(secrets.geocoder_api_key.clone())),
            spam: Arc::new(HttpSpamClassifier::new(
                config.spam.classifier_endpoint.clone(),
            )),
        };
        Ok(Arc::new(Self::new(config, ports, store, vault)))
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn ledger(&self) -> &Arc<LoadLedger> {
        self.router.ledger()
    }

    pub fn store(&self) -> &ProgressStore {
        self.runner.store()
    }

    /// Request cooperative cancellation of a running batch.
    pub fn cancel(&self, batch_id: Uuid) -> Result<()> {
        let batches = self.batches.read();
        let state = batches
            .get(&batch_id)
            .ok_or(FlowError::BatchNotFound(batch_id))?;
        state.handle.cancel();
        info!(batch_id = %batch_id, "batch cancellation requested");
        Ok(())
    }

    /// Snapshot of a batch's progress, for external polling.
    pub fn progress(&self, batch_id: Uuid) -> Option<ProgressReport> {
        let batches = self.batches.read();
        let state = batches.get(&batch_id)?;
        let inner = state.progress.lock();
        Some(ProgressReport {
            batch_id,
            total: inner.total,
            processed: inner.processed,
            spam: inner.spam,
            current: inner.current,
            status: inner.status,
            results: inner.results.clone(),
        })
    }

    /// Process a whole batch to completion and return its report.
    pub async fn start(
        self: &Arc<Self>,
        batch: Batch,
        mut tickets: Vec<Ticket>,
        roster: Roster,
    ) -> Result<BatchReport> {
        let batch_id = batch.id;
        let total = tickets.len();

        let state = {
            let mut batches = self.batches.write();
            if let Some(existing) = batches.get(&batch_id) {
                if existing.progress.lock().status == BatchStatus::Processing {
                    return Err(FlowError::BatchAlreadyRunning(batch_id));
                }
            }
            let (handle, token) = cancel_pair();
            let state = Arc::new(BatchState {
                handle,
                token,
                progress: Mutex::new(ProgressInner {
                    total,
                    processed: 0,
                    spam: 0,
                    current: 0,
                    status: BatchStatus::Processing,
                    results: Vec::new(),
                }),
            });
            batches.insert(batch_id, Arc::clone(&state));
            state
        };

        info!(batch_id = %batch_id, total, filename = %batch.filename, "batch started");
        self.resolver.start_batch();
        self.bus.publish(
            StageEvent::batch(batch_id, Stage::Pipeline)
                .with_status(StageStatus::InProgress)
                .with_data(payload([("total", total)]))
                .with_message(format!("processing {total} tickets")),
        );

        let repeat_counts = repeat_counts(&tickets);
        tickets.sort_by_key(|t| t.row_index);

        let mut tasks: JoinSet<Result<TicketResult>> = JoinSet::new();
        for ticket in tickets {
            let orchestrator = Arc::clone(self);
            let state = Arc::clone(&state);
            let repeat = ticket
                .client_ref
                .as_deref()
                .and_then(|r| repeat_counts.get(r).copied())
                .unwrap_or(0);
            tasks.spawn(async move {
                let token = state.token.clone();
                let result = orchestrator
                    .run_ticket(&ticket, &token, total, repeat)
                    .await?;
                let mut progress = state.progress.lock();
                progress.processed += 1;
                progress.current = ticket.row_index;
                if result.is_spam {
                    progress.spam += 1;
                }
                progress.results.push(result.clone());
                Ok(result)
            });
        }

        let mut results = Vec::with_capacity(total);
        let mut fatal: Option<String> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(result)) => results.push(result),
                Ok(Err(err)) => {
                    fatal = Some(err.to_string());
                    tasks.abort_all();
                    break;
                }
                Err(join_err) => {
                    fatal = Some(format!("ticket task aborted: {join_err}"));
                    tasks.abort_all();
                    break;
                }
            }
        }

        if let Some(reason) = fatal {
            state.progress.lock().status = BatchStatus::Failed;
            self.bus.publish(
                StageEvent::batch(batch_id, Stage::Pipeline)
                    .with_status(StageStatus::Failed)
                    .with_message(reason.clone()),
            );
            return Err(FlowError::BatchFailed { batch_id, reason });
        }

        results.sort_by_key(|r| r.row_index);

        let cancelled = state.token.is_cancelled();
        if !cancelled {
            self.route_phase(batch_id, &mut results, &roster).await?;
        }

        let spam = results.iter().filter(|r| r.is_spam).count();
        let enriched = results.iter().filter(|r| !r.is_spam).count();
        let routed = results.iter().filter(|r| r.assignment.is_some()).count();
        let failed = results
            .iter()
            .filter(|r| !r.failed_stages.is_empty())
            .count();
        let status = if cancelled {
            BatchStatus::Cancelled
        } else {
            BatchStatus::Completed
        };

        {
            let mut progress = state.progress.lock();
            progress.status = status;
            progress.results = results.clone();
        }

        let mut data = payload([
            ("total", Value::from(total)),
            ("spam", Value::from(spam)),
            ("enriched", Value::from(enriched)),
            ("routed", Value::from(routed)),
            ("failed", Value::from(failed)),
        ]);
        if cancelled {
            data.insert("cancelled".to_string(), Value::Bool(true));
        }
        self.bus.publish(
            StageEvent::batch(batch_id, Stage::Pipeline)
                .with_status(StageStatus::Completed)
                .with_data(data)
                .with_message(format!(
                    "batch complete: {total} tickets ({spam} spam, {routed} routed)"
                )),
        );
        info!(
            batch_id = %batch_id,
            total, spam, enriched, routed, failed,
            cancelled,
            "batch done"
        );

        Ok(BatchReport {
            batch_id,
            status,
            total,
            spam,
            enriched,
            routed,
            failed,
            results,
        })
    }

    /// One ticket through spam, PII, the LLM‖geocode join and priority.
    /// Returns `Err` only on infrastructure failure.
    async fn run_ticket(
        &self,
        ticket: &Ticket,
        token: &CancelToken,
        total_rows: usize,
        repeat_count: u32,
    ) -> Result<TicketResult> {
        let ticket_id = ticket.id;
        let batch_id = ticket.batch_id;
        let mut result = TicketResult::new(ticket);

        // Spam check first; a positive verdict closes the ticket here.
        let spam_policy = StagePolicy::spam(&self.config.pipeline);
        let filter = Arc::clone(&self.spam_filter);
        let text = ticket.description.clone();
        let spam_run = self
            .runner
            .run(ticket_id, batch_id, Stage::SpamFilter, &spam_policy, token, move |_| {
                let filter = Arc::clone(&filter);
                let text = text.clone();
                async move {
                    let verdict = filter.check(&text).await?;
                    let data = payload([
                        ("is_spam", Value::Bool(verdict.is_spam)),
                        ("probability", Value::from(verdict.probability)),
                    ]);
                    let message = verdict.reason.clone();
                    Ok(StageOutput::new(verdict, message).with_data(data))
                }
            })
            .await?;

        match spam_run {
            StageResult::Completed(verdict) => {
                result.spam_probability = Some(verdict.probability);
                if verdict.is_spam {
                    result.is_spam = true;
                    info!(ticket_id = %ticket_id, probability = verdict.probability, "spam, short-circuiting");
                    return Ok(result);
                }
            }
            StageResult::AlreadyCompleted => {}
            StageResult::Failed(_) => {
                // A broken spam check never blocks the ticket.
                result.failed_stages.push(Stage::SpamFilter);
            }
        }

        // Scrub before anything leaves the process.
        let vault = Arc::clone(&self.vault);
        let text = ticket.description.clone();
        let pii_run = self
            .runner
            .run(
                ticket_id,
                batch_id,
                Stage::PiiScrub,
                &StagePolicy::local(&self.config.pipeline),
                token,
                move |_| {
                    let vault = Arc::clone(&vault);
                    let text = text.clone();
                    async move {
                        let (scrubbed, count) = vault
                            .scrub(ticket_id, &text)
                            .map_err(|e| StageError::Permanent(e.to_string()))?;
                        Ok(StageOutput::new(
                            scrubbed,
                            format!("scrubbed {count} PII entities"),
                        )
                        .with_data(payload([("pii_count", count)])))
                    }
                },
            )
            .await?;

        let scrubbed_text = match pii_run {
            StageResult::Completed(scrubbed) => scrubbed,
            StageResult::AlreadyCompleted => self
                .vault
                .scrub(ticket_id, &ticket.description)
                .map(|(scrubbed, _)| scrubbed)
                .unwrap_or_default(),
            StageResult::Failed(_) => {
                // Never ship unscrubbed text to a vendor.
                result.failed_stages.push(Stage::PiiScrub);
                String::new()
            }
        };

        // LLM analysis and geocoding run concurrently.
        let llm_fut = {
            let runner = self.runner.clone();
            let policy = StagePolicy::llm(&self.config.pipeline);
            let permits = Arc::clone(&self.llm_permits);
            let llm = Arc::clone(&self.llm);
            let token = token.clone();
            let request = AnalysisRequest {
                text: scrubbed_text.clone(),
                age: ticket.effective_age(),
                segment: ticket.segment,
                attachments: ticket.attachments.clone(),
            };
            async move {
                let _permit = permits
                    .acquire()
                    .await
                    .map_err(|_| FlowError::Store("llm permits closed".into()))?;
                runner
                    .run(ticket_id, batch_id, Stage::LlmAnalysis, &policy, &token, move |_| {
                        let llm = Arc::clone(&llm);
                        let request = request.clone();
                        async move {
                            let analysis = llm.analyze(request).await?;
                            let data = payload([
                                ("detected_type", analysis.detected_type.as_str()),
                                ("language", analysis.language.as_str()),
                                ("sentiment", analysis.sentiment.as_str()),
                            ]);
                            Ok(StageOutput::new(analysis, "analysis completed").with_data(data))
                        }
                    })
                    .await
            }
        };

        let geo_fut = {
            let runner = self.runner.clone();
            let policy = StagePolicy::geocode(&self.config.pipeline);
            let permits = Arc::clone(&self.geocode_permits);
            let resolver = Arc::clone(&self.resolver);
            let token = token.clone();
            let address = ticket.address.clone();
            async move {
                let _permit = permits
                    .acquire()
                    .await
                    .map_err(|_| FlowError::Store("geocode permits closed".into()))?;
                runner
                    .run(ticket_id, batch_id, Stage::Geocode, &policy, &token, move |_| {
                        let resolver = Arc::clone(&resolver);
                        let address = address.clone();
                        async move {
                            let resolution = resolver.resolve(&address).await?;
                            let mut data = payload([
                                ("provider", Value::from(resolution.provider.clone())),
                                ("status", Value::from(resolution.status.as_str())),
                            ]);
                            if let Some(point) = resolution.point {
                                data.insert("lat".to_string(), Value::from(point.lat));
                                data.insert("lon".to_string(), Value::from(point.lon));
                            }
                            let message = resolution.explanation.clone();
                            Ok(StageOutput::new(resolution, message).with_data(data))
                        }
                    })
                    .await
            }
        };

        let (llm_run, geo_run) = tokio::join!(llm_fut, geo_fut);

        let mut analysis = match llm_run? {
            StageResult::Completed(llm) => merge_analysis(llm),
            StageResult::AlreadyCompleted => {
                Analysis::fallback("analysis result not recoverable after restart")
            }
            StageResult::Failed(err) => {
                result.failed_stages.push(Stage::LlmAnalysis);
                Analysis::fallback(&err.to_string())
            }
        };

        let geo: GeoResolution = match geo_run? {
            StageResult::Completed(resolution) => resolution,
            StageResult::AlreadyCompleted => GeoResolution {
                point: None,
                provider: "none".to_string(),
                status: AddressStatus::Unknown,
                explanation: "geocode result not recoverable after restart".to_string(),
            },
            StageResult::Failed(err) => {
                result.failed_stages.push(Stage::Geocode);
                GeoResolution {
                    point: None,
                    provider: "none".to_string(),
                    status: AddressStatus::Unknown,
                    explanation: err.to_string(),
                }
            }
        };
        result.coordinates = geo.point;
        result.address_status = geo.status.as_str().to_string();

        // Summaries go back to humans, so tokens get rehydrated.
        if !analysis.summary.is_empty() {
            match self.vault.rehydrate(ticket_id, &analysis.summary) {
                Ok(summary) => analysis.summary = summary,
                Err(err) => warn!(ticket_id = %ticket_id, error = %err, "summary rehydration failed"),
            }
        }

        // Priority scoring over the (possibly partial) analysis.
        let scorer = self.scorer.clone();
        let score_ticket = ticket.clone();
        let detected_type = analysis.detected_type;
        let sentiment = analysis.sentiment;
        let priority_run = self
            .runner
            .run(
                ticket_id,
                batch_id,
                Stage::Priority,
                &StagePolicy::local(&self.config.pipeline),
                token,
                move |_| {
                    let scorer = scorer.clone();
                    let score_ticket = score_ticket.clone();
                    async move {
                        let score = scorer.score(PriorityInput {
                            ticket: &score_ticket,
                            detected_type,
                            sentiment,
                            total_rows,
                            repeat_count,
                        });
                        let message = format!("priority {:.2}", score.score);
                        let breakdown = score.breakdown.clone();
                        Ok(StageOutput::new(score, message).with_data(breakdown))
                    }
                },
            )
            .await?;

        let score = match priority_run {
            StageResult::Completed(score) => score,
            // Pure computation: recompute rather than carry defaults.
            _ => self.scorer.score(PriorityInput {
                ticket,
                detected_type,
                sentiment,
                total_rows,
                repeat_count,
            }),
        };
        analysis.priority_base = score.base;
        analysis.priority_extra = score.extras;
        analysis.priority_final = score.score;
        analysis.priority_breakdown = score.breakdown;

        result.analysis = Some(analysis);
        Ok(result)
    }

    /// Batch-wide routing over everything that reached priority.
    async fn route_phase(
        &self,
        batch_id: Uuid,
        results: &mut [TicketResult],
        roster: &Roster,
    ) -> Result<()> {
        let requests: Vec<RouteRequest> = results
            .iter()
            .filter(|r| !r.is_spam)
            .filter_map(|r| {
                let analysis = r.analysis.as_ref()?;
                Some(RouteRequest {
                    ticket_id: r.ticket_id,
                    row_index: r.row_index,
                    segment: r.segment,
                    detected_type: analysis.detected_type,
                    language: analysis.language,
                    priority: analysis.priority_final,
                    coordinates: r.coordinates,
                })
            })
            .collect();

        if requests.is_empty() {
            return Ok(());
        }

        let decisions = self
            .router
            .route_batch(requests, &roster.agents, &roster.offices);

        for decision in decisions {
            let Some(result) = results.iter_mut().find(|r| r.ticket_id == decision.ticket_id)
            else {
                continue;
            };
            let outcome = StageOutcome::started(decision.ticket_id, batch_id, Stage::Routing);
            match decision.outcome {
                Ok(assignment) => {
                    self.runner
                        .persist(outcome.completed(&assignment.explanation))
                        .await?;
                    let mut data = assignment.routing_details.clone();
                    data.insert(
                        "agent_id".to_string(),
                        Value::from(assignment.agent_id.clone()),
                    );
                    data.insert(
                        "office_id".to_string(),
                        Value::from(assignment.office_id.clone()),
                    );
                    self.bus.publish(
                        StageEvent::ticket(decision.ticket_id, batch_id, Stage::Routing)
                            .with_status(StageStatus::Completed)
                            .with_field("assignment")
                            .with_data(data)
                            .with_message(assignment.explanation.clone()),
                    );
                    result.assignment = Some(assignment);
                }
                Err(failure) => {
                    self.runner
                        .persist(outcome.failed(failure.as_str()))
                        .await?;
                    self.bus.publish(
                        StageEvent::ticket(decision.ticket_id, batch_id, Stage::Routing)
                            .with_status(StageStatus::Failed)
                            .with_message(failure.as_str()),
                    );
                    result.routing_failure = Some(failure.as_str().to_string());
                    result.failed_stages.push(Stage::Routing);
                }
            }
        }

        Ok(())
    }
}

fn merge_analysis(llm: LlmAnalysis) -> Analysis {
    let detected_type = if llm.needs_data_change && llm.detected_type != TicketType::DataChange {
        TicketType::DataChange
    } else {
        llm.detected_type
    };
    Analysis {
        detected_type,
        language: llm.language,
        language_is_mixed: llm.language_is_mixed,
        sentiment: llm.sentiment,
        sentiment_confidence: llm.sentiment_confidence,
        summary: llm.summary,
        anomaly_flags: llm.anomaly_flags,
        priority_base: 0.0,
        priority_extra: 0.0,
        priority_final: 0.0,
        priority_breakdown: crate::domain::Payload::new(),
    }
}

fn repeat_counts(tickets: &[Ticket]) -> HashMap<String, u32> {
    let mut counts: HashMap<String, u32> = HashMap::new();
    for ticket in tickets {
        if let Some(client_ref) = ticket.client_ref.as_deref() {
            *counts.entry(client_ref.to_string()).or_insert(0) += 1;
        }
    }
    counts
}
