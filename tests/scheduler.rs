mod common;

use chunked_tts::tts::{
    CancellationHandle, Language, PlaybackScheduler, RequestError, RequestOutcome, Stage,
    TextChunk,
};
use common::{chunks, config, events, synthesizer, EventLog, ScriptedFrontEnd, TimedSink};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

struct Running {
    handle: CancellationHandle,
    outcome: oneshot::Receiver<RequestOutcome>,
    played: Arc<Mutex<Vec<usize>>>,
}

fn start(scheduler: &PlaybackScheduler, chunks: Vec<TextChunk>) -> Running {
    let played = Arc::new(Mutex::new(Vec::new()));
    let (tx, outcome) = oneshot::channel();
    let played_log = Arc::clone(&played);
    let handle = scheduler.play(
        chunks,
        Language::English,
        move |chunk| played_log.lock().unwrap().push(chunk.index),
        move |outcome| {
            tx.send(outcome).unwrap();
        },
    );
    Running {
        handle,
        outcome,
        played,
    }
}

fn scheduler(front_end: ScriptedFrontEnd, sink: TimedSink, concurrency: usize, lookahead: usize) -> PlaybackScheduler {
    PlaybackScheduler::new(
        Arc::new(synthesizer(Arc::new(front_end))),
        Box::new(sink),
        &config(concurrency, lookahead),
    )
}

fn position(log: &[String], event: &str) -> usize {
    log.iter()
        .position(|e| e == event)
        .unwrap_or_else(|| panic!("missing event {event} in {log:?}"))
}

#[tokio::test]
async fn test_playback_order_ignores_synthesis_order() {
    let log = EventLog::default();
    let front_end = ScriptedFrontEnd::new(log.clone()).delay("aaaa", Duration::from_millis(200));
    let (sink, _started) = TimedSink::new(log.clone());
    let scheduler = scheduler(front_end, sink, 2, 2);

    let run = start(&scheduler, chunks(&["aaaa", "bb"]));
    let outcome = run.outcome.await.unwrap();

    assert!(matches!(outcome, RequestOutcome::Completed { played: 2 }));
    assert_eq!(*run.played.lock().unwrap(), vec![1, 2]);

    let log = events(&log);
    // Chunk 2 finished synthesis first but still played second.
    assert!(position(&log, "tokenized:bb") < position(&log, "tokenized:aaaa"));
    assert!(position(&log, "enqueued:1") < position(&log, "enqueued:2"));
    assert!(position(&log, "played:1") < position(&log, "played:2"));
    assert_eq!(log.last().map(String::as_str), Some("finish"));
}

#[tokio::test]
async fn test_cancel_during_first_chunk() {
    let log = EventLog::default();
    let front_end = ScriptedFrontEnd::new(log.clone()).delay("bb", Duration::from_millis(600));
    let (sink, mut started) = TimedSink::new(log.clone());
    let scheduler = scheduler(front_end, sink, 2, 2);

    let run = start(&scheduler, chunks(&["aaaaa", "bb", "cc"]));
    assert_eq!(started.recv().await, Some(1));
    assert!(run.handle.cancel());

    let outcome = run.outcome.await.unwrap();
    assert!(matches!(outcome, RequestOutcome::Cancelled { played: 0 }));
    assert!(run.played.lock().unwrap().is_empty());

    run.handle.finished().await;
    assert!(run.handle.is_finished());
    assert!(!run.handle.cancel());

    let log = events(&log);
    assert!(log.contains(&"stop".to_string()));
    assert!(!log.iter().any(|e| e.starts_with("played:") || e == "enqueued:2"));
}

#[tokio::test]
async fn test_failure_stops_scheduling_and_reports_once() {
    let log = EventLog::default();
    let front_end = ScriptedFrontEnd::new(log.clone());
    let (sink, _started) = TimedSink::new(log.clone());
    let scheduler = scheduler(front_end, sink, 1, 1);

    let run = start(&scheduler, chunks(&["aaa", "FAIL", "ccc"]));
    let outcome = run.outcome.await.unwrap();

    match outcome {
        RequestOutcome::Failed { played, error } => {
            assert_eq!(played, 1);
            assert_eq!(error.chunk_index(), Some(2));
            assert_eq!(error.stage(), Some(Stage::Tokenize));
            assert!(matches!(error, RequestError::Synthesis { chunk: 2, .. }));
            assert!(error.to_string().contains("tokenization"));
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(*run.played.lock().unwrap(), vec![1]);

    let log = events(&log);
    assert!(log.contains(&"played:1".to_string()));
    assert!(!log.contains(&"tokenize:ccc".to_string()));
}

#[tokio::test]
async fn test_failure_skips_queued_chunks_with_default_window() {
    let log = EventLog::default();
    // Chunk 1 holds its permit until well after chunk 2 has failed.
    let front_end = ScriptedFrontEnd::new(log.clone()).delay("aaa", Duration::from_millis(100));
    let (sink, _started) = TimedSink::new(log.clone());
    // Chunk 3 is issued up front and waits for the permit chunk 2 frees.
    let scheduler = scheduler(front_end, sink, 2, 2);

    let run = start(&scheduler, chunks(&["aaa", "FAIL", "ccc"]));
    match run.outcome.await.unwrap() {
        RequestOutcome::Failed { played, error } => {
            assert_eq!(played, 1);
            assert_eq!(error.chunk_index(), Some(2));
            assert_eq!(error.stage(), Some(Stage::Tokenize));
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(*run.played.lock().unwrap(), vec![1]);

    let log = events(&log);
    assert!(log.contains(&"tokenize:FAIL".to_string()));
    assert!(!log.contains(&"tokenize:ccc".to_string()), "{:?}", log);
    assert!(!log.contains(&"enqueued:3".to_string()));
}

#[tokio::test]
async fn test_lowest_failing_chunk_wins() {
    let log = EventLog::default();
    // Chunk 3 fails first; chunk 2 fails later and is the one reported.
    let front_end = ScriptedFrontEnd::new(log.clone()).delay("FAIL-2", Duration::from_millis(150));
    let (sink, _started) = TimedSink::new(log.clone());
    let scheduler = scheduler(front_end, sink, 3, 3);

    let run = start(&scheduler, chunks(&["a", "FAIL-2", "FAIL-3"]));
    match run.outcome.await.unwrap() {
        RequestOutcome::Failed { played, error } => {
            assert_eq!(played, 1);
            assert_eq!(error.chunk_index(), Some(2));
        }
        other => panic!("expected failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_empty_request_opens_and_closes_one_session() {
    let log = EventLog::default();
    let (sink, _started) = TimedSink::new(log.clone());
    let scheduler = scheduler(ScriptedFrontEnd::new(log.clone()), sink, 2, 2);

    let run = start(&scheduler, Vec::new());
    let outcome = run.outcome.await.unwrap();
    assert!(matches!(outcome, RequestOutcome::Completed { played: 0 }));
    assert!(run.played.lock().unwrap().is_empty());
    assert_eq!(events(&log), vec!["begin", "finish"]);
}

#[tokio::test]
async fn test_lookahead_bounds_synthesis() {
    let log = EventLog::default();
    let (sink, _started) = TimedSink::new(log.clone());
    let scheduler = scheduler(ScriptedFrontEnd::new(log.clone()), sink, 4, 1);

    let run = start(&scheduler, chunks(&["c1", "c2", "c3", "c4", "c5"]));
    let outcome = run.outcome.await.unwrap();
    assert!(matches!(outcome, RequestOutcome::Completed { played: 5 }));
    assert_eq!(*run.played.lock().unwrap(), vec![1, 2, 3, 4, 5]);

    // With a lookahead of one, chunk j waits until chunk j-2 has played.
    let log = events(&log);
    for j in 3..=5 {
        assert!(
            position(&log, &format!("played:{}", j - 2)) < position(&log, &format!("tokenize:c{}", j)),
            "chunk {} issued too early: {:?}",
            j,
            log
        );
    }
}

#[tokio::test]
async fn test_device_error_aborts_request() {
    let log = EventLog::default();
    let (sink, _started) = TimedSink::new(log.clone());
    let sink = sink.fail_enqueue_at(2);
    let scheduler = scheduler(ScriptedFrontEnd::new(log.clone()), sink, 2, 2);

    let run = start(&scheduler, chunks(&["aa", "bb", "cc"]));
    match run.outcome.await.unwrap() {
        RequestOutcome::Failed { error, .. } => {
            assert!(matches!(error, RequestError::PlaybackDevice { chunk: 2, .. }));
            assert_eq!(error.stage(), None);
        }
        other => panic!("expected device failure, got {:?}", other),
    }
    assert!(events(&log).contains(&"stop".to_string()));
}

#[tokio::test]
async fn test_cancel_before_start_reports_once() {
    let log = EventLog::default();
    let (sink, _started) = TimedSink::new(log.clone());
    let scheduler = scheduler(ScriptedFrontEnd::new(log.clone()), sink, 2, 2);

    let run = start(&scheduler, chunks(&["aa"]));
    assert!(run.handle.cancel());
    assert!(!run.handle.cancel());

    let outcome = run.outcome.await.unwrap();
    assert!(matches!(outcome, RequestOutcome::Cancelled { played: 0 }));
    assert!(run.played.lock().unwrap().is_empty());
}
