use std::sync::Arc;

use plandent_core::gateway::ScriptStep;
use plandent_core::plan::PlanShape;
use plandent_core::reconcile::reconcile;
use plandent_core::repair::repair;
use plandent_core::session::DegradedReason;
use plandent_core::{
    extract_partial, ChannelObserver, ExtractionEvent, ExtractionPipeline, ExtractionRequest,
    ExtractionSession, FinishReason, JsonFilePlanStore, OutputQuality, PartialJsonExtractor,
    PlanStore, PromptVariant, ScriptedGateway, SessionOptions, SessionState, SourceDocument,
};
use serde_json::{json, Value};

fn request(variant: PromptVariant) -> ExtractionRequest {
    let document =
        SourceDocument::from_bytes(b"Devis dentaire - Jean Dupont".to_vec(), "text/plain").unwrap();
    ExtractionRequest::new(document, variant)
}

async fn collect_events(
    gateway: ScriptedGateway,
    variant: PromptVariant,
) -> (SessionState, Vec<ExtractionEvent>) {
    let (observer, mut rx) = ChannelObserver::new();
    let session = ExtractionSession::new(
        Arc::new(gateway),
        Arc::new(observer),
        SessionOptions::default(),
    );
    let state = session.start(request(variant)).await.unwrap();
    drop(session);

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    (state, events)
}

// ============================================================================
// Streaming session
// ============================================================================

#[tokio::test]
async fn test_end_to_end_three_chunks() {
    let gateway = ScriptedGateway::from_chunks([
        r#"{"patient":"Jean Dupont","#,
        r#""phases":[{"numero":1,"nom":"Phase A","total_phase":100}]"#,
        "}",
    ]);
    let (state, events) = collect_events(gateway, PromptVariant::Legacy).await;
    assert_eq!(state, SessionState::Completed);

    let kinds: Vec<&str> = events.iter().map(ExtractionEvent::kind).collect();
    assert_eq!(
        kinds,
        vec!["progress", "progress", "data", "progress", "progress", "complete"]
    );

    let data: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ExtractionEvent::Data { snapshot } => Some(snapshot),
            _ => None,
        })
        .collect();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0].patient.as_deref(), Some("Jean Dupont"));
    assert_eq!(data[0].phases.as_ref().unwrap()[0].name, "Phase A");

    match events.last().unwrap() {
        ExtractionEvent::Complete(output) => {
            assert_eq!(output.quality, OutputQuality::Full);
            assert_eq!(output.snapshot.phases.as_ref().unwrap()[0].phase_total, 100.0);
            assert_eq!(output.plan["phases"][0]["total_phase"], 100);
        }
        other => panic!("expected complete, got {other:?}"),
    }

    match &events[events.len() - 2] {
        ExtractionEvent::Progress {
            percent_complete, ..
        } => assert_eq!(*percent_complete, 100),
        other => panic!("expected final progress, got {other:?}"),
    }
}

#[tokio::test]
async fn test_cancellation_silences_observer() {
    let (gateway, feed) = ScriptedGateway::live();
    let (observer, mut rx) = ChannelObserver::new();
    let session = ExtractionSession::new(
        Arc::new(gateway),
        Arc::new(observer),
        SessionOptions::default(),
    );
    let handle = session.handle();
    let run = tokio::spawn(async move { session.start(request(PromptVariant::Legacy)).await });

    feed.chunk(r#"{"patient":"Jean","phases":[{"numero":1,"nom":"A"}],"#);
    loop {
        match rx.recv().await {
            Some(ExtractionEvent::Data { .. }) => break,
            Some(_) => continue,
            None => panic!("session ended before delivering data"),
        }
    }

    handle.cancel();
    assert_eq!(handle.state(), SessionState::Cancelled);

    // Chunks pushed after the checkpoint must never surface
    feed.chunk(r#""etat_general":["gingivite"],"#);

    let final_state = run.await.unwrap().unwrap();
    assert_eq!(final_state, SessionState::Cancelled);

    // The gateway stopped reading upstream once the session ended
    assert!(feed.is_closed());
    feed.chunk(r#""phases_extra":[]}"#);
    feed.finish(FinishReason::Stop);
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn test_truncated_task_response_completes_with_placeholder_task() {
    let gateway = ScriptedGateway::from_steps([
        ScriptStep::Chunk(r#"{"taches":[{"id":"T1","nom":"Consultation""#.to_string()),
        ScriptStep::Finish(FinishReason::Length),
    ]);
    let (state, events) = collect_events(gateway, PromptVariant::TaskBased).await;
    assert_eq!(state, SessionState::Completed);
    assert!(events.iter().all(|e| !matches!(e, ExtractionEvent::Error { .. })));

    match events.last().unwrap() {
        ExtractionEvent::Complete(output) => {
            assert_eq!(
                output.quality,
                OutputQuality::Degraded {
                    reason: DegradedReason::Truncated
                }
            );
            let tasks = output.snapshot.tasks.as_ref().unwrap();
            assert!(!tasks.is_empty());
            assert!(output.plan["tasks"].as_array().is_some_and(|t| !t.is_empty()));
        }
        other => panic!("expected complete, got {other:?}"),
    }
}

// ============================================================================
// Partial extraction and repair
// ============================================================================

#[test]
fn test_known_fields_never_regress_across_prefixes() {
    let response = json!({
        "patient": "Marie Curie",
        "date_devis": "2024-03-12",
        "etat_general": ["parodontite", "caries multiples"],
        "resume_langage_clair": "Deux phases de soins.",
        "phases": [
            {"numero": 1, "nom": "Assainissement", "groupes_actes": [
                {"type": "parodontologie", "actes": [
                    {"libelle": "Surfaçage", "dents": [31, 32], "cout_unitaire": 80}
                ]}
            ]},
            {"numero": 2, "nom": "Prothèse", "total_phase": 950}
        ]
    })
    .to_string();

    let mut extractor = PartialJsonExtractor::new();
    let mut previous_known = 0;
    let mut previous_phases = 0;
    let mut boundary = 0;
    while boundary < response.len() {
        boundary += response[boundary..].chars().next().map_or(1, char::len_utf8);
        if let Some(update) = extractor.update(&response[..boundary]) {
            let known = update.snapshot.known_field_count();
            let phases = update.snapshot.phases.as_ref().map_or(0, Vec::len);
            assert!(known >= previous_known, "known fields regressed at {boundary}");
            assert!(phases >= previous_phases, "phase list shrank at {boundary}");
            previous_known = known;
            previous_phases = phases;
        }
    }

    let last = extractor.latest().unwrap();
    assert_eq!(last.known_field_count(), 5);
    assert_eq!(last.phases.as_ref().unwrap().len(), 2);
}

#[test]
fn test_partial_extraction_tolerates_garbage_around_output() {
    let snapshot =
        extract_partial("Voici le plan :\n```json\n{\"patient\": \"Jean\", \"phases\": [{\"numero\": 1")
            .unwrap();
    assert_eq!(snapshot.patient.as_deref(), Some("Jean"));
}

#[test]
fn test_repair_is_identity_on_valid_json() {
    for text in [
        r#"{"patient":"Jean","phases":[]}"#,
        r#"{"taches":[{"id":"T1","dependances":["T0"]}],"note":"a \"quoted\" {brace}"}"#,
        "[1, 2, {\"a\": null}]",
        r#"{"patient":"Jean","resume_langage_clair":"voir ```note``` ci-dessous","phases":[]}"#,
    ] {
        let expected: Value = serde_json::from_str(text).unwrap();
        assert_eq!(repair(text).unwrap(), expected);
    }
}

#[test]
fn test_partial_extraction_survives_backticks_in_values() {
    let snapshot = extract_partial(
        r#"{"patient":"Jean","resume_langage_clair":"voir ```note``` ci-dessous","phases":[{"numero":1,"nom":"A"}"#,
    )
    .unwrap();
    assert_eq!(snapshot.patient.as_deref(), Some("Jean"));
    assert_eq!(snapshot.plain_summary.as_deref(), Some("voir ```note``` ci-dessous"));
    assert_eq!(snapshot.phases.unwrap()[0].name, "A");
}

// ============================================================================
// Reconciliation
// ============================================================================

#[test]
fn test_raw_output_round_trips_for_every_shape() {
    let shapes = [
        (
            json!({"phases": [{"numero": 1, "nom": "A", "groupes_actes": []}]}),
            PlanShape::LegacyPhases,
        ),
        (
            json!({"taches": [{"id": "T1", "nom": "Consultation", "phase": 1}]}),
            PlanShape::Tasks,
        ),
        (
            json!({"sections": [{"nom": "Urgences", "taches": [{"id": "T1", "nom": "Extraction"}]}]}),
            PlanShape::Sections,
        ),
    ];

    for (raw, shape) in shapes {
        let plan = reconcile(&raw).unwrap();
        assert_eq!(plan.source_shape, shape);
        assert_eq!(plan.raw_model_output, raw);
    }
}

#[test]
fn test_cost_inference_from_unit_cost() {
    let plan = reconcile(&json!({
        "phases": [{"numero": 1, "nom": "Soins", "groupes_actes": [{
            "type": "soins",
            "actes": [{"libelle": "Composite", "dents": [11, 12, 13], "cout_unitaire": 100}]
        }]}]
    }))
    .unwrap();

    let act = &plan.phases[0].act_groups[0].acts[0];
    assert_eq!(act.total_cost, Some(300.0));
}

#[test]
fn test_unrecognized_shape_is_rejected() {
    let err = reconcile(&json!({"foo": "bar"})).unwrap_err();
    assert!(err.to_string().contains("Unrecognized plan shape"));
}

// ============================================================================
// Pipeline with persistence
// ============================================================================

#[tokio::test]
async fn test_streaming_pipeline_saves_degraded_plan_to_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonFilePlanStore::open(dir.path()).unwrap());
    let pipeline = ExtractionPipeline::new(Arc::new(ScriptedGateway::from_steps([
        ScriptStep::Chunk(r#"{"patient":"Jean","taches":[{"id":"T1","nom":"Consultation"}"#.to_string()),
        ScriptStep::Chunk(r#","#.to_string()),
        ScriptStep::Finish(FinishReason::Length),
    ])))
    .with_store(store.clone());

    let (observer, _rx) = ChannelObserver::new();
    let outcome = pipeline
        .run_streaming(request(PromptVariant::TaskBased), Arc::new(observer))
        .await
        .unwrap()
        .unwrap();

    assert!(outcome.quality.is_degraded());
    assert_eq!(outcome.plan.tasks[0].id, "T1");
    assert_eq!(outcome.plan.phases.len(), 1);

    let listed = store.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(Some(listed[0].id), outcome.plan_id);
    assert_eq!(listed[0].patient.as_deref(), Some("Jean"));

    let stored = store.get(listed[0].id).await.unwrap();
    assert_eq!(
        stored.plan.raw_model_text.as_deref(),
        Some(r#"{"patient":"Jean","taches":[{"id":"T1","nom":"Consultation"},"#)
    );
}

#[tokio::test]
async fn test_full_output_keeps_no_separate_raw_text() {
    let pipeline = ExtractionPipeline::new(Arc::new(ScriptedGateway::from_chunks([
        r#"{"taches":[{"id":"T1","nom":"Consultation"}]}"#,
    ])));
    let (observer, _rx) = ChannelObserver::new();
    let outcome = pipeline
        .run_streaming(request(PromptVariant::TaskBased), Arc::new(observer))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome.quality, OutputQuality::Full);
    assert!(outcome.plan.raw_model_text.is_none());
    assert_eq!(outcome.plan.raw_model_output["taches"][0]["id"], "T1");
}
