//! Per-feature behaviour of the originate engine: ringback, confirmation,
//! variable import, failed-leg CDRs, held calls and the group abort rules.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use softswitch_originate_core::{
    Application, ApplicationTable, CauseCode, Channel, ChannelHandle, Disposal, EngineConfig,
    LegScript, LoopbackChannel, LoopbackFactory, OriginateEngine, OriginateRequest, RaceOutcome,
    RecordingBridge, SwitchServices,
};

fn engine(factory: &Arc<LoopbackFactory>) -> OriginateEngine {
    OriginateEngine::new(SwitchServices::new(factory.clone()), EngineConfig::default())
}

#[tokio::test(start_paused = true)]
async fn test_ringback_streams_until_answer_and_restores_codec() {
    let factory = Arc::new(LoopbackFactory::new());
    factory.script("a", LegScript::new().wait(200).ring().wait(1000).answer());
    let orig = LoopbackChannel::originator("sofia/in");
    orig.set_variable("ringback", Some("%(1000,4000,440,480)"));

    let outcome = engine(&factory)
        .originate(OriginateRequest::new("sofia/a").with_originator(orig.clone()))
        .await
        .unwrap();

    assert!(outcome.is_success());
    let frames = orig.written_frames();
    assert!(frames.len() >= 40, "only {} ringback frames", frames.len());
    assert!(frames.iter().all(|f| f.samples == 160));
    assert_eq!(orig.codec_restores(), 1);
    assert!(orig.raw_codec().is_none());
    assert_eq!(orig.ring_ready_sent(), 0);
    assert_eq!(orig.answer_calls(), 1);
    assert_eq!(
        orig.get_variable("originate_disposition").as_deref(),
        Some("call accepted")
    );
}

#[tokio::test(start_paused = true)]
async fn test_ring_is_relayed_when_no_ringback_is_configured() {
    let factory = Arc::new(LoopbackFactory::new());
    factory
        .script("a", LegScript::new().wait(100).ring())
        .script("b", LegScript::new().wait(200).ring().wait(300).answer());
    let orig = LoopbackChannel::originator("sofia/in");

    let outcome = engine(&factory)
        .originate(OriginateRequest::new("sofia/a,sofia/b").with_originator(orig.clone()))
        .await
        .unwrap();

    assert!(outcome.is_success());
    assert_eq!(orig.ring_ready_sent(), 1);
    assert!(orig.written_frames().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_early_media_wins_unless_ignored() {
    let factory = Arc::new(LoopbackFactory::new());
    factory.script("a", LegScript::new().wait(100).early_media().wait(900).answer());
    let orig = LoopbackChannel::originator("sofia/in");

    let started = tokio::time::Instant::now();
    let outcome = engine(&factory)
        .originate(OriginateRequest::new("sofia/a").with_originator(orig.clone()))
        .await
        .unwrap();
    assert!(outcome.is_success());
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(orig.pre_answer_calls(), 1);
    assert_eq!(orig.answer_calls(), 0);

    let started = tokio::time::Instant::now();
    let outcome = engine(&factory)
        .originate(OriginateRequest::new("{ignore_early_media=true}sofia/a"))
        .await
        .unwrap();
    assert!(outcome.is_success());
    assert!(started.elapsed() >= Duration::from_millis(1000));
}

#[tokio::test(start_paused = true)]
async fn test_confirmed_leg_wins_and_late_confirmation_is_ignored() {
    let factory = Arc::new(LoopbackFactory::new());
    factory
        .script("a", LegScript::new().wait(100).answer().wait(400).dtmf("1"))
        .script("b", LegScript::new().wait(100).answer().wait(500).dtmf("1"));

    let outcome = engine(&factory)
        .originate(OriginateRequest::new("{group_confirm_key=1}sofia/a,sofia/b"))
        .await
        .unwrap();

    assert_eq!(outcome.last_race, Some(RaceOutcome::Winner(0)));
    let a = &factory.legs_for("a")[0];
    let b = &factory.legs_for("b")[0];
    assert!(a.hangup_calls().is_empty());
    assert_eq!(b.hangup_calls(), vec![CauseCode::LoseRace]);

    // b's key arrives after the race is over
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(b.hangup_calls(), vec![CauseCode::LoseRace]);
    assert!(a.is_ready());
}

#[tokio::test(start_paused = true)]
async fn test_wrong_key_plays_error_prompt() {
    let factory = Arc::new(LoopbackFactory::new());
    factory.script(
        "a",
        LegScript::new().wait(100).answer().wait(100).dtmf("9").wait(300).dtmf("1"),
    );

    let outcome = engine(&factory)
        .originate(OriginateRequest::new(
            "{group_confirm_key=1,group_confirm_file=confirm.wav,group_confirm_error_file=wrong.wav}sofia/a",
        ))
        .await
        .unwrap();

    assert!(outcome.is_success());
    assert_eq!(
        factory.legs_for("a")[0].played_files(),
        vec!["confirm.wav", "wrong.wav", "confirm.wav"]
    );
}

struct Greeting(AtomicUsize);

#[async_trait]
impl Application for Greeting {
    async fn execute(&self, channel: &ChannelHandle, args: Option<&str>) -> anyhow::Result<()> {
        channel.play_file(args.unwrap_or("default.wav")).await?;
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_exec_confirmation_runs_application() {
    let factory = Arc::new(LoopbackFactory::new());
    factory.script("a", LegScript::new().wait(100).answer());
    let greeting = Arc::new(Greeting(AtomicUsize::new(0)));
    let apps = ApplicationTable::new();
    apps.register("greet", greeting.clone());
    let services = SwitchServices::new(factory.clone()).with_applications(Arc::new(apps));

    let outcome = OriginateEngine::new(services, EngineConfig::default())
        .originate(OriginateRequest::new(
            "{group_confirm_key=exec,group_confirm_file='greet hello.wav'}sofia/a",
        ))
        .await
        .unwrap();

    assert!(outcome.is_success());
    assert_eq!(greeting.0.load(Ordering::SeqCst), 1);
    assert_eq!(factory.legs_for("a")[0].played_files(), vec!["hello.wav"]);
}

#[tokio::test(start_paused = true)]
async fn test_winner_variables_are_imported() {
    let factory = Arc::new(LoopbackFactory::new());
    factory.script("b", LegScript::new().wait(100).answer());
    let orig = LoopbackChannel::originator("sofia/in");

    let outcome = engine(&factory)
        .originate(
            OriginateRequest::new(
                "sofia/a,[import='sip_term_status,absent',sip_term_status=200]sofia/b",
            )
            .with_originator(orig.clone()),
        )
        .await
        .unwrap();

    assert!(outcome.is_success());
    assert_eq!(orig.get_variable("sip_term_status").as_deref(), Some("200"));
    assert_eq!(orig.get_variable("absent"), None);
}

#[tokio::test(start_paused = true)]
async fn test_failed_legs_leave_cdrs_on_originator() {
    let factory = Arc::new(LoopbackFactory::new());
    factory
        .script("a", LegScript::new().wait(100).hangup(CauseCode::UserBusy))
        .script("b", LegScript::new().wait(200).hangup(CauseCode::CallRejected));
    let orig = LoopbackChannel::originator("sofia/in");
    orig.set_variable("failed_xml_cdr_prefix", Some("failed_cdr"));

    let outcome = engine(&factory)
        .originate(OriginateRequest::new("sofia/a,sofia/b").with_originator(orig.clone()))
        .await
        .unwrap();

    assert_eq!(outcome.cause, CauseCode::UserBusy);
    assert_eq!(outcome.last_race, Some(RaceOutcome::AllRejected));
    assert_eq!(orig.get_variable("failed_cdr_total").as_deref(), Some("2"));
    let first = orig.get_variable("failed_cdr_1").unwrap();
    assert!(first.contains(factory.legs_for("a")[0].uuid()));
    assert!(first.contains("USER_BUSY"));
    assert!(orig.get_variable("failed_cdr_2").unwrap().contains("CALL_REJECTED"));
    assert_eq!(orig.get_variable("originate_disposition").as_deref(), Some("USER_BUSY"));
}

#[tokio::test(start_paused = true)]
async fn test_single_reject_fails_the_group() {
    let factory = Arc::new(LoopbackFactory::new());
    factory
        .script("a", LegScript::new().wait(100).hangup(CauseCode::UserBusy))
        .script("b", LegScript::new().wait(50).ring())
        .script("c", LegScript::new().wait(50).ring());

    let started = tokio::time::Instant::now();
    let outcome = engine(&factory)
        .originate(OriginateRequest::new(
            "{fail_on_single_reject=USER_BUSY}sofia/a,sofia/b,sofia/c",
        ))
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(outcome.cause, CauseCode::UserBusy);
    assert_eq!(outcome.last_race, Some(RaceOutcome::AllRejected));
    for data in ["b", "c"] {
        assert_eq!(factory.legs_for(data)[0].hangup_calls().len(), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_unlisted_reject_keeps_racing() {
    let factory = Arc::new(LoopbackFactory::new());
    factory
        .script("a", LegScript::new().wait(100).hangup(CauseCode::NoRouteDestination))
        .script("b", LegScript::new().wait(600).answer());

    let outcome = engine(&factory)
        .originate(OriginateRequest::new(
            "{fail_on_single_reject=USER_BUSY}sofia/a,sofia/b",
        ))
        .await
        .unwrap();

    assert!(outcome.is_success());
    assert_eq!(outcome.last_race, Some(RaceOutcome::Winner(1)));
}

#[tokio::test(start_paused = true)]
async fn test_required_leg_takes_the_group_down() {
    let factory = Arc::new(LoopbackFactory::new());
    factory
        .script("a", LegScript::new().wait(100).hangup(CauseCode::CallRejected))
        .script("b", LegScript::new().wait(50).ring().wait(5000).answer());

    let outcome = engine(&factory)
        .originate(OriginateRequest::new("[leg_required=true]sofia/a,sofia/b"))
        .await
        .unwrap();

    assert_eq!(outcome.cause, CauseCode::CallRejected);
    assert_eq!(factory.legs_for("b")[0].hangup_calls(), vec![CauseCode::CallRejected]);
}

#[tokio::test(start_paused = true)]
async fn test_progress_timeout_without_ringing() {
    let factory = Arc::new(LoopbackFactory::new());

    let started = tokio::time::Instant::now();
    let outcome = engine(&factory)
        .originate(OriginateRequest::new("{progress_timeout=2,originate_timeout=30}sofia/a"))
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(outcome.cause, CauseCode::ProgressTimeout);
    assert_eq!(outcome.last_race, Some(RaceOutcome::Timeout));
    assert_eq!(
        factory.legs_for("a")[0].hangup_calls(),
        vec![CauseCode::ProgressTimeout]
    );
}

#[tokio::test(start_paused = true)]
async fn test_leg_timeout_drops_one_leg_only() {
    let factory = Arc::new(LoopbackFactory::new());
    factory
        .script("a", LegScript::new().wait(100).ring())
        .script("b", LegScript::new().wait(100).ring().wait(2000).answer());

    let outcome = engine(&factory)
        .originate(OriginateRequest::new("[leg_timeout=1]sofia/a,sofia/b"))
        .await
        .unwrap();

    assert!(outcome.is_success());
    assert_eq!(
        factory.legs_for("a")[0].hangup_calls(),
        vec![CauseCode::AllottedTimeout]
    );
    assert_eq!(
        outcome.dispositions[0].disposal,
        Disposal::AlreadyDown(CauseCode::AllottedTimeout)
    );
}

#[tokio::test(start_paused = true)]
async fn test_holding_call_is_bridged_to_first_loser() {
    let factory = Arc::new(LoopbackFactory::new());
    factory
        .script("a", LegScript::new().wait(100).ring())
        .script("b", LegScript::new().wait(300).answer());
    let bridge = Arc::new(RecordingBridge::new());
    let services = SwitchServices::new(factory.clone()).with_bridge(bridge.clone());
    let orig = LoopbackChannel::originator("sofia/in");
    orig.set_variable("soft_holding_uuid", Some("held-7"));

    let outcome = OriginateEngine::new(services, EngineConfig::default())
        .originate(OriginateRequest::new("sofia/a,sofia/b").with_originator(orig.clone()))
        .await
        .unwrap();

    assert!(outcome.is_success());
    let a = &factory.legs_for("a")[0];
    assert_eq!(bridge.bridged(), vec![("held-7".to_string(), a.uuid().to_string())]);
    assert!(a.hangup_calls().is_empty());
    assert_eq!(orig.get_variable("soft_holding_uuid"), None);
}
