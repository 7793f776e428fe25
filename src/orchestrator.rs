//! Pipeline orchestrator — drives the five stage agents in dependency
//! order, overlaps each stage with the next stage's warmup, and owns the
//! session registry.
//!
//! State machine: Intake → ICD → CPT → Doctor → Summary → Done, with
//! AwaitingAnswer reachable from ICD/CPT when the coder asks a
//! clarifying question, and Failed reachable from any stage. Transitions
//! are driven only by agent completion; the sole external trigger is
//! "continue with answer", which re-runs the branching stage with the
//! answer appended to the Q&A history.
//!
//! Constructed once per process with owned agents and providers, passed
//! by reference. No ambient globals.

use std::sync::Arc;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use thiserror::Error;
use tokio_stream::wrappers::BroadcastStream;

use crate::agents::{
    AgentError, CptAgent, DoctorAgent, IcdAgent, QaExchange, RetryPromptMode, SummaryAgent,
    SymptomAgent,
};
use crate::models::{
    ConsultationRequest, CptAssessment, IcdAssessment, PatientData, PipelinePosition,
    ProviderMatch, StageName, StagePayload, StageResult, SymptomReport,
};
use crate::providers::CapabilityProvider;
use crate::session::{
    EvictionPolicy, PendingQuestion, Session, SessionHandle, SessionRegistry,
};
use crate::stream::{
    take_through_terminal, BroadcastSink, BufferingSink, EventSink, StageEvent, StreamEvent,
    TeeSink,
};

/// How many providers a consultation recommends.
const PROVIDER_COUNT: usize = 2;

// ═══════════════════════════════════════════════════════════
// Errors and snapshots
// ═══════════════════════════════════════════════════════════

/// Caller errors from session operations. Surfaced immediately, without
/// side effects.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("session is {actual}, expected awaiting_answer")]
    InvalidState { actual: PipelinePosition },

    #[error(transparent)]
    Agent(#[from] AgentError),
}

/// Read-only view of a session for the session endpoint.
#[derive(Debug, serde::Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub status: PipelinePosition,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub symptoms: String,
    /// Whether the consultation asked for incremental delivery.
    pub stream: bool,
    pub patient_data: Option<PatientData>,
    pub results: Vec<StageResult>,
    pub qa_history: Vec<QaExchange>,
    pub pending_question: Option<PendingQuestion>,
}

// ═══════════════════════════════════════════════════════════
// Warmup scope
// ═══════════════════════════════════════════════════════════

/// Structured scope for fire-and-forget warmup tasks. Completion is
/// never awaited and failure is swallowed inside `warmup` itself; the
/// scope guarantees no warmup task outlives the pipeline run that
/// spawned it.
#[derive(Default)]
struct WarmupScope {
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl WarmupScope {
    fn spawn(&mut self, provider: Arc<dyn CapabilityProvider>, model: String) {
        self.handles.push(tokio::spawn(async move {
            provider.warmup(&model).await;
        }));
    }
}

impl Drop for WarmupScope {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Orchestrator
// ═══════════════════════════════════════════════════════════

pub struct Orchestrator {
    symptom: SymptomAgent,
    icd: IcdAgent,
    cpt: CptAgent,
    doctor: DoctorAgent,
    summary: SummaryAgent,
    registry: SessionRegistry,
    remote: Arc<dyn CapabilityProvider>,
    local: Arc<dyn CapabilityProvider>,
    remote_model: String,
    local_model: String,
}

impl Orchestrator {
    pub fn new(
        remote: Arc<dyn CapabilityProvider>,
        local: Arc<dyn CapabilityProvider>,
        remote_model: &str,
        local_model: &str,
        retry_mode: RetryPromptMode,
        policy: EvictionPolicy,
    ) -> Self {
        Self {
            symptom: SymptomAgent::new(Arc::clone(&remote), remote_model, retry_mode),
            icd: IcdAgent::new(Arc::clone(&local), local_model, retry_mode),
            cpt: CptAgent::new(Arc::clone(&local), local_model, retry_mode),
            doctor: DoctorAgent::new(Arc::clone(&remote), remote_model, retry_mode),
            summary: SummaryAgent::new(Arc::clone(&remote), remote_model, retry_mode),
            registry: SessionRegistry::new(policy),
            remote,
            local,
            remote_model: remote_model.to_string(),
            local_model: local_model.to_string(),
        }
    }

    // ── Session lifecycle ────────────────────────────────────

    /// Start a consultation and run the pipeline in the background.
    /// Returns the session id immediately; progress flows through the
    /// session's event channel.
    pub async fn start_streaming(self: &Arc<Self>, request: ConsultationRequest) -> String {
        let (session_id, handle) = self.register(request);
        let sink: Arc<dyn EventSink> = Arc::new(BroadcastSink::new(handle.events.clone()));
        tokio::spawn(Arc::clone(self).run_from(handle, StageName::Intake, sink));
        session_id
    }

    /// Degraded mode: run the pipeline to its pause point and return the
    /// full buffered event sequence as one aggregate. Events are still
    /// mirrored to the session's live channel for any subscriber.
    pub async fn start_buffered(
        self: &Arc<Self>,
        request: ConsultationRequest,
    ) -> (String, Vec<StreamEvent>) {
        let (session_id, handle) = self.register(request);
        let buffer = Arc::new(BufferingSink::new());
        let sink: Arc<dyn EventSink> = Arc::new(TeeSink::new(
            BroadcastSink::new(handle.events.clone()),
            Arc::clone(&buffer),
        ));
        Arc::clone(self)
            .run_from(handle, StageName::Intake, sink)
            .await;
        (session_id, buffer.drain().await)
    }

    fn register(&self, mut request: ConsultationRequest) -> (String, Arc<SessionHandle>) {
        let session_id = request
            .session_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        request.session_id = Some(session_id.clone());
        tracing::info!(%session_id, "consultation started");
        let handle = self.registry.insert(Session::new(session_id.clone(), request));
        (session_id, handle)
    }

    /// Replay already-completed stage results, then attach to live
    /// progress. Replay and attach happen under the session lock, so a
    /// late subscriber sees every event exactly once.
    pub async fn stream(
        &self,
        session_id: &str,
    ) -> Result<BoxStream<'static, StreamEvent>, OrchestratorError> {
        let handle = self
            .registry
            .get(session_id)
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))?;

        let session = handle.state.lock().await;
        let mut replay: Vec<StreamEvent> = session
            .results
            .iter()
            .map(|result| {
                StreamEvent::Stage(StageEvent {
                    stage: result.stage,
                    status: result.status,
                    message: result.message.clone(),
                    result: result.payload.clone(),
                    question: None,
                })
            })
            .collect();

        match session.position {
            PipelinePosition::AwaitingAnswer => {
                if let Some(pending) = &session.pending_question {
                    replay.push(StreamEvent::stage_question(
                        pending.stage,
                        pending.question.clone(),
                    ));
                }
            }
            PipelinePosition::Done => replay.push(StreamEvent::done(session.id.clone())),
            PipelinePosition::Failed => {
                let reason = session
                    .results
                    .iter()
                    .rev()
                    .find_map(|r| r.message.clone())
                    .unwrap_or_else(|| "consultation failed".to_string());
                replay.push(StreamEvent::error_for_session(
                    "agent_failure",
                    reason,
                    session.id.clone(),
                ));
            }
            _ => {}
        }

        if session.position.is_terminal() {
            return Ok(futures_util::stream::iter(replay).boxed());
        }

        let rx = handle.events.subscribe();
        drop(session);

        let live = BroadcastStream::new(rx).filter_map(|item| async move { item.ok() });
        Ok(take_through_terminal(futures_util::stream::iter(replay).chain(live)).boxed())
    }

    /// Resume an AwaitingAnswer session and stream the resumed events
    /// from where the pipeline paused.
    pub async fn resume_streaming(
        self: &Arc<Self>,
        session_id: &str,
        answer: &str,
    ) -> Result<BoxStream<'static, StreamEvent>, OrchestratorError> {
        let (handle, stage) = self.prepare_resume(session_id, answer).await?;
        // Subscribe before spawning so no resumed event is missed.
        let rx = handle.events.subscribe();
        let sink: Arc<dyn EventSink> = Arc::new(BroadcastSink::new(handle.events.clone()));
        tokio::spawn(Arc::clone(self).run_from(handle, stage, sink));

        let live = BroadcastStream::new(rx).filter_map(|item| async move { item.ok() });
        Ok(take_through_terminal(live).boxed())
    }

    /// Degraded-mode resume: run to the next pause point and return the
    /// buffered events.
    pub async fn resume_buffered(
        self: &Arc<Self>,
        session_id: &str,
        answer: &str,
    ) -> Result<Vec<StreamEvent>, OrchestratorError> {
        let (handle, stage) = self.prepare_resume(session_id, answer).await?;
        let buffer = Arc::new(BufferingSink::new());
        let sink: Arc<dyn EventSink> = Arc::new(TeeSink::new(
            BroadcastSink::new(handle.events.clone()),
            Arc::clone(&buffer),
        ));
        Arc::clone(self).run_from(handle, stage, sink).await;
        Ok(buffer.drain().await)
    }

    /// Validate the resume and move the session back into the stage it
    /// branched from. Fails without mutating when the session is not
    /// awaiting an answer.
    async fn prepare_resume(
        &self,
        session_id: &str,
        answer: &str,
    ) -> Result<(Arc<SessionHandle>, StageName), OrchestratorError> {
        let handle = self
            .registry
            .get(session_id)
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))?;

        let mut session = handle.state.lock().await;
        if session.position != PipelinePosition::AwaitingAnswer {
            return Err(OrchestratorError::InvalidState {
                actual: session.position,
            });
        }
        let Some(pending) = session.pending_question.take() else {
            return Err(OrchestratorError::InvalidState {
                actual: session.position,
            });
        };

        let stage = pending.stage;
        session.qa_history.push(QaExchange {
            stage,
            question: pending.question,
            answer: answer.to_string(),
        });
        session.position = stage.into();
        tracing::info!(%session_id, %stage, "consultation resumed with answer");
        drop(session);

        Ok((handle, stage))
    }

    /// Read-only session view.
    pub async fn snapshot(&self, session_id: &str) -> Result<SessionSnapshot, OrchestratorError> {
        let handle = self
            .registry
            .get(session_id)
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))?;
        let session = handle.state.lock().await;
        Ok(SessionSnapshot {
            session_id: session.id.clone(),
            status: session.position,
            created_at: session.created_at,
            symptoms: session.request.symptoms.clone(),
            stream: session.request.stream,
            patient_data: session.request.patient_data.clone(),
            results: session.results.clone(),
            qa_history: session.qa_history.clone(),
            pending_question: session.pending_question.clone(),
        })
    }

    /// Delete a session. Returns whether it existed.
    pub fn delete_session(&self, session_id: &str) -> bool {
        self.registry.remove(session_id)
    }

    /// Additional provider recommendations for a session whose doctor
    /// stage already ran.
    pub async fn more_providers(
        &self,
        session_id: &str,
        count: usize,
    ) -> Result<Vec<ProviderMatch>, OrchestratorError> {
        let handle = self
            .registry
            .get(session_id)
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))?;

        let (icd_codes, symptoms, current_names) = {
            let session = handle.state.lock().await;
            let icd_codes = match session.payload(StageName::Icd) {
                Some(StagePayload::Icd(assessment)) => assessment.icd_codes.clone(),
                _ => {
                    return Err(OrchestratorError::InvalidState {
                        actual: session.position,
                    })
                }
            };
            let symptoms = match session.payload(StageName::Intake) {
                Some(StagePayload::Symptoms(report)) => report.clone(),
                _ => SymptomReport {
                    symptoms: vec![session.request.symptoms.clone()],
                    pregnancy_related: false,
                },
            };
            let current_names = match session.payload(StageName::Doctor) {
                Some(StagePayload::Providers(matches)) => {
                    matches.iter().map(|m| m.name.clone()).collect()
                }
                _ => Vec::new(),
            };
            (icd_codes, symptoms, current_names)
        };

        Ok(self
            .doctor
            .more_providers(&icd_codes, &current_names, &symptoms, count)
            .await?)
    }

    /// Warm every agent once, at startup. Failures are swallowed inside
    /// the providers.
    pub async fn warmup_all(&self) {
        tokio::join!(
            self.symptom.warmup(),
            self.icd.warmup(),
            self.cpt.warmup(),
            self.doctor.warmup(),
            self.summary.warmup(),
        );
    }

    /// Sweep expired sessions. Called by the periodic eviction task.
    pub fn evict_expired_sessions(&self) -> usize {
        self.registry.evict_expired()
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    // ── Pipeline run ─────────────────────────────────────────

    /// Run the pipeline from `start` to completion, a clarifying-question
    /// pause, or a stage failure. All emitted events go through `sink`;
    /// stage results and position changes happen under the session lock.
    async fn run_from(
        self: Arc<Self>,
        handle: Arc<SessionHandle>,
        start: StageName,
        sink: Arc<dyn EventSink>,
    ) {
        let mut scope = WarmupScope::default();

        let (request, session_id) = {
            let session = handle.state.lock().await;
            (session.request.clone(), session.id.clone())
        };

        // Prior stage payloads, present when resuming mid-pipeline.
        let mut symptoms = self.stored_symptoms(&handle).await;
        let mut icd: Option<IcdAssessment> = self.stored_icd(&handle).await;
        let mut cpt: Option<CptAssessment> = self.stored_cpt(&handle).await;
        let mut providers: Vec<ProviderMatch> = Vec::new();

        let mut stage = Some(start);
        while let Some(current) = stage {
            self.spawn_next_warmup(current, &mut scope);
            let qa_history = { handle.state.lock().await.qa_history.clone() };

            match current {
                StageName::Intake => {
                    sink.emit(StreamEvent::stage_in_progress(
                        current,
                        "Extracting symptoms...",
                    ))
                    .await;
                    match self
                        .symptom
                        .stream_process(&request.symptoms, request.patient_data.as_ref())
                        .await
                    {
                        Ok(snapshots) => {
                            for partial in &snapshots[..snapshots.len().saturating_sub(1)] {
                                sink.emit(StreamEvent::stage_streaming(
                                    current,
                                    StagePayload::Symptoms(partial.clone()),
                                ))
                                .await;
                            }
                            // stream_process always ends with the full report
                            let report = snapshots.last().cloned().unwrap_or(SymptomReport {
                                symptoms: vec![request.symptoms.clone()],
                                pregnancy_related: false,
                            });
                            self.complete_stage(
                                &handle,
                                &sink,
                                current,
                                StagePayload::Symptoms(report.clone()),
                            )
                            .await;
                            symptoms = Some(report);
                        }
                        Err(err) => {
                            self.fail_stage(&handle, &sink, current, &err).await;
                            return;
                        }
                    }
                }

                StageName::Icd => {
                    sink.emit(StreamEvent::stage_in_progress(
                        current,
                        "Analyzing diagnostic codes...",
                    ))
                    .await;
                    let Some(report) = symptoms.as_ref() else {
                        self.fail_missing(&handle, &sink, current, StageName::Intake).await;
                        return;
                    };
                    match self.icd.process(report, &qa_history).await {
                        Ok(assessment) => {
                            if let Some(question) = assessment.questions.first() {
                                self.pause_for_question(&handle, &sink, current, question.clone())
                                    .await;
                                return;
                            }
                            self.complete_stage(
                                &handle,
                                &sink,
                                current,
                                StagePayload::Icd(assessment.clone()),
                            )
                            .await;
                            icd = Some(assessment);
                        }
                        Err(err) => {
                            self.fail_stage(&handle, &sink, current, &err).await;
                            return;
                        }
                    }
                }

                StageName::Cpt => {
                    sink.emit(StreamEvent::stage_in_progress(
                        current,
                        "Generating procedure codes...",
                    ))
                    .await;
                    let (Some(report), Some(assessment)) = (symptoms.as_ref(), icd.as_ref())
                    else {
                        self.fail_missing(&handle, &sink, current, StageName::Icd).await;
                        return;
                    };
                    match self
                        .cpt
                        .process(report, &assessment.icd_codes, &qa_history)
                        .await
                    {
                        Ok(result) => {
                            if let Some(question) = result.questions.first() {
                                self.pause_for_question(&handle, &sink, current, question.clone())
                                    .await;
                                return;
                            }
                            self.complete_stage(
                                &handle,
                                &sink,
                                current,
                                StagePayload::Cpt(result.clone()),
                            )
                            .await;
                            cpt = Some(result);
                        }
                        Err(err) => {
                            self.fail_stage(&handle, &sink, current, &err).await;
                            return;
                        }
                    }
                }

                StageName::Doctor => {
                    sink.emit(StreamEvent::stage_in_progress(
                        current,
                        "Selecting healthcare providers...",
                    ))
                    .await;
                    let (Some(report), Some(assessment)) = (symptoms.as_ref(), icd.as_ref())
                    else {
                        self.fail_missing(&handle, &sink, current, StageName::Icd).await;
                        return;
                    };
                    let mut matches = self
                        .doctor
                        .select_providers(&assessment.icd_codes, PROVIDER_COUNT);
                    let mut failed = None;
                    for matched in &mut matches {
                        match self.doctor.explain(matched, report).await {
                            Ok(explanation) => {
                                matched.explanation = Some(explanation);
                                // One intermediate update per explained provider
                                sink.emit(StreamEvent::stage_streaming(
                                    current,
                                    StagePayload::Providers(vec![matched.clone()]),
                                ))
                                .await;
                            }
                            Err(err) => {
                                failed = Some(err);
                                break;
                            }
                        }
                    }
                    if let Some(err) = failed {
                        self.fail_stage(&handle, &sink, current, &err).await;
                        return;
                    }
                    self.complete_stage(
                        &handle,
                        &sink,
                        current,
                        StagePayload::Providers(matches.clone()),
                    )
                    .await;
                    providers = matches;
                }

                StageName::Summary => {
                    sink.emit(StreamEvent::stage_in_progress(
                        current,
                        "Summarizing the consultation...",
                    ))
                    .await;
                    let (Some(report), Some(icd_a), Some(cpt_a)) =
                        (symptoms.as_ref(), icd.as_ref(), cpt.as_ref())
                    else {
                        self.fail_missing(&handle, &sink, current, StageName::Cpt).await;
                        return;
                    };
                    match self.summary.process(report, icd_a, cpt_a, &providers).await {
                        Ok(text) => {
                            self.complete_stage(
                                &handle,
                                &sink,
                                current,
                                StagePayload::Summary(text),
                            )
                            .await;
                        }
                        Err(err) => {
                            self.fail_stage(&handle, &sink, current, &err).await;
                            return;
                        }
                    }
                }
            }

            stage = current.next();
        }

        sink.emit(StreamEvent::done(session_id.clone())).await;
        tracing::info!(%session_id, "consultation complete");
    }

    /// Fire-and-forget warmup for the stage after `current`. Completion
    /// is not awaited before the next stage's real call.
    fn spawn_next_warmup(&self, current: StageName, scope: &mut WarmupScope) {
        let next = match current.next() {
            Some(next) => next,
            None => return,
        };
        let (provider, model) = match next {
            StageName::Icd | StageName::Cpt => {
                (Arc::clone(&self.local), self.local_model.clone())
            }
            StageName::Intake | StageName::Doctor | StageName::Summary => {
                (Arc::clone(&self.remote), self.remote_model.clone())
            }
        };
        scope.spawn(provider, model);
    }

    /// Append the completed result and advance the position, emitting
    /// the completion event under the session lock so replay and live
    /// delivery never diverge.
    async fn complete_stage(
        &self,
        handle: &Arc<SessionHandle>,
        sink: &Arc<dyn EventSink>,
        stage: StageName,
        payload: StagePayload,
    ) {
        let mut session = handle.state.lock().await;
        session.results.push(StageResult::completed(stage, payload.clone()));
        session.position = stage
            .next()
            .map(PipelinePosition::from)
            .unwrap_or(PipelinePosition::Done);
        handle.touch();
        sink.emit(StreamEvent::stage_completed(stage, payload)).await;
    }

    /// Record the terminal failure. The session is halted, not
    /// destroyed: it stays queryable with its partial results intact.
    async fn fail_stage(
        &self,
        handle: &Arc<SessionHandle>,
        sink: &Arc<dyn EventSink>,
        stage: StageName,
        err: &AgentError,
    ) {
        let reason = err.to_string();
        let kind = match err {
            AgentError::Provider { source, .. } => source.kind(),
            AgentError::Parse { .. } => "agent_failure",
        };
        tracing::error!(%stage, %reason, "stage failed, halting pipeline");

        let mut session = handle.state.lock().await;
        session.results.push(StageResult::failed(stage, reason.clone()));
        session.position = PipelinePosition::Failed;
        handle.touch();
        let session_id = session.id.clone();
        sink.emit(StreamEvent::stage_failed(stage, reason.clone())).await;
        sink.emit(StreamEvent::error_for_session(kind, reason, session_id))
            .await;
    }

    async fn fail_missing(
        &self,
        handle: &Arc<SessionHandle>,
        sink: &Arc<dyn EventSink>,
        stage: StageName,
        missing: StageName,
    ) {
        let err = AgentError::Parse {
            stage,
            reason: format!("missing prerequisite result from {missing} stage"),
        };
        self.fail_stage(handle, sink, stage, &err).await;
    }

    /// Park the session in AwaitingAnswer with the question that caused
    /// the pause. The stage is re-run on resume, so no result is stored.
    async fn pause_for_question(
        &self,
        handle: &Arc<SessionHandle>,
        sink: &Arc<dyn EventSink>,
        stage: StageName,
        question: String,
    ) {
        tracing::info!(%stage, "pausing for clarifying answer");
        let mut session = handle.state.lock().await;
        session.pending_question = Some(PendingQuestion {
            stage,
            question: question.clone(),
        });
        session.position = PipelinePosition::AwaitingAnswer;
        handle.touch();
        sink.emit(StreamEvent::stage_question(stage, question)).await;
    }

    // ── Stored payload readers ───────────────────────────────

    async fn stored_symptoms(&self, handle: &Arc<SessionHandle>) -> Option<SymptomReport> {
        let session = handle.state.lock().await;
        match session.payload(StageName::Intake) {
            Some(StagePayload::Symptoms(report)) => Some(report.clone()),
            _ => None,
        }
    }

    async fn stored_icd(&self, handle: &Arc<SessionHandle>) -> Option<IcdAssessment> {
        let session = handle.state.lock().await;
        match session.payload(StageName::Icd) {
            Some(StagePayload::Icd(assessment)) => Some(assessment.clone()),
            _ => None,
        }
    }

    async fn stored_cpt(&self, handle: &Arc<SessionHandle>) -> Option<CptAssessment> {
        let session = handle.state.lock().await;
        match session.payload(StageName::Cpt) {
            Some(StagePayload::Cpt(assessment)) => Some(assessment.clone()),
            _ => None,
        }
    }
}
