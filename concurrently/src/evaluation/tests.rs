use super::*;
use crate::error::{Error, ProtocolError};
use crate::runtime::{self, Builder};
use crate::test_utils::*;
use anyhow::{Result, anyhow};
use futures::FutureExt;
use rstest::rstest;
use static_assertions::assert_not_impl_any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

assert_not_impl_any!(Evaluation<u32>: Send, Sync);
assert_not_impl_any!(EvaluationRef: Send, Sync);

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

/// Work that stays suspended until resumed with `()`, then returns `value`.
fn parked<T: 'static>(value: T) -> crate::Result<Evaluation<T>> {
    runtime::start(async move {
        await_resume::<()>().await?;
        Ok(value)
    })
}

#[test]
fn test_conclude_with_succeeds_exactly_once() -> Result<()> {
    init_event_loop(None)?;
    let evaluation = parked(1_u32)?;

    evaluation.conclude_with(Ok(2))?;
    let second = evaluation.conclude_with(Ok(3));

    assert!(matches!(
        second,
        Err(Error::Protocol(ProtocolError::AlreadyConcluded))
    ));
    assert_eq!(evaluation.try_result().transpose()?, Some(2));
    Ok(())
}

#[test]
fn test_resume_requires_waiting_and_leaves_state_untouched() -> Result<()> {
    let (event_loop, _) = init_event_loop(None)?;

    let finished = runtime::start(async { Ok(()) })?;
    assert!(matches!(
        finished.resume(1_u32),
        Err(Error::Protocol(ProtocolError::NotWaiting))
    ));

    let evaluation = parked(())?;
    evaluation.resume(())?;
    let before = event_loop.stats();

    assert!(matches!(
        evaluation.resume(()),
        Err(Error::Protocol(ProtocolError::NotWaiting))
    ));
    assert_eq!(event_loop.stats(), before);
    assert_eq!(before.immediate_entries, 1);
    Ok(())
}

#[test]
fn test_resume_before_deadline_withdraws_timeout() -> Result<()> {
    let (event_loop, driver) = init_event_loop(None)?;

    let evaluation = runtime::start(async {
        let n: u32 = await_resume_with(AwaitOptions::new().within(ms(10))).await?;
        Ok(n)
    })?;
    assert_eq!(event_loop.stats().timed_entries, 1);

    evaluation.resume(7_u32)?;
    assert_eq!(event_loop.stats().timed_entries, 0);

    driver.advance(ms(100));
    assert_eq!(event_loop.run_once()?, 1);
    assert_eq!(evaluation.try_result().transpose()?, Some(7));
    Ok(())
}

#[test]
fn test_conclusion_before_deadline_withdraws_waiter_timeout() -> Result<()> {
    let (event_loop, _) = init_event_loop(None)?;

    let target = parked(5_u32)?;
    let awaited = target.clone();
    let waiter = runtime::start(async move {
        awaited
            .await_result_opts(AwaitOptions::new().within(ms(10)))
            .await
    })?;
    assert_eq!(event_loop.stats().timed_entries, 1);

    target.resume(())?;
    event_loop.run_once()?;
    assert!(target.is_concluded());
    assert_eq!(event_loop.stats().timed_entries, 0);

    event_loop.run_once()?;
    assert_eq!(waiter.try_result().transpose()?, Some(5));
    Ok(())
}

#[test]
fn test_timeout_fires_at_deadline_and_never_before() -> Result<()> {
    let (event_loop, driver) = init_event_loop(None)?;

    let target = parked(1_u32)?;
    let awaited = target.clone();
    let waiter = runtime::start(async move {
        awaited
            .await_result_opts(AwaitOptions::new().within(ms(10)))
            .await
    })?;

    driver.advance(ms(9));
    assert_eq!(event_loop.run_once()?, 0);
    assert!(!waiter.is_concluded());
    assert_eq!(driver.parks(), 1);

    assert_eq!(event_loop.run_once()?, 1);
    assert!(driver.elapsed() >= ms(10));
    assert!(matches!(waiter.try_result(), Some(Err(Error::Timeout(d))) if d == ms(10)));

    // Only the awaiting call timed out.
    assert!(!target.is_concluded());
    assert!(target.is_waiting());
    Ok(())
}

#[test]
fn test_cancel_reaches_every_current_and_future_waiter() -> Result<()> {
    let (event_loop, _) = init_event_loop(None)?;

    let target = parked(1_u32)?;
    let waiters = (0..2)
        .map(|_| {
            let awaited = target.clone();
            runtime::start(async move { awaited.await_result().await })
        })
        .collect::<crate::Result<Vec<_>>>()?;

    target.cancel_with("shutting down")?;
    assert!(!target.is_waiting());
    event_loop.run_once()?;

    for waiter in &waiters {
        match waiter.try_result() {
            Some(Err(Error::Cancelled(reason))) => assert_eq!(reason, "shutting down"),
            other => panic!("expected cancellation, got {:?}", other),
        }
    }

    let late = target.await_result().now_or_never();
    assert!(matches!(late, Some(Err(Error::Cancelled(_)))));

    assert!(matches!(
        target.cancel(),
        Err(Error::Protocol(ProtocolError::AlreadyConcluded))
    ));
    assert!(matches!(
        target.try_result(),
        Some(Err(Error::Cancelled(reason))) if reason == "shutting down"
    ));
    Ok(())
}

#[rstest]
#[case::one(1)]
#[case::few(8)]
#[case::many(256)]
fn test_sequential_work_reuses_one_context(#[case] n: u32) -> Result<()> {
    let (event_loop, _) = init_event_loop(None)?;

    for i in 0..n {
        let evaluation = runtime::start(async {
            let v: u32 = await_resume().await?;
            Ok(v)
        })?;

        evaluation.resume(i)?;
        event_loop.run_once()?;
        assert_eq!(evaluation.try_result().transpose()?, Some(i));
    }

    assert_eq!(event_loop.stats().contexts_created, 1);
    Ok(())
}

#[test]
fn test_immediate_resumptions_run_in_schedule_order() -> Result<()> {
    let (event_loop, _) = init_event_loop(None)?;
    let log = Rc::new(RefCell::new(Vec::new()));

    let start = |name: &'static str| {
        let log = log.clone();
        runtime::start(async move {
            await_resume::<()>().await?;
            log.borrow_mut().push(name);
            Ok(())
        })
    };

    let a = start("a")?;
    let b = start("b")?;

    b.resume(())?;
    a.resume(())?;
    assert_eq!(event_loop.run_once()?, 2);

    assert_eq!(*log.borrow(), ["b", "a"]);
    Ok(())
}

#[test]
fn test_synchronous_work_yields_result_without_suspending() -> Result<()> {
    let (event_loop, _) = init_event_loop(None)?;

    let evaluation = runtime::start(async { Ok(42) })?;

    let res = evaluation.await_result().now_or_never();
    assert_eq!(res.transpose()?, Some(42));
    assert!(!EvaluationRef::current().is_waiting());
    assert_eq!(event_loop.stats().immediate_entries, 0);
    Ok(())
}

#[test]
fn test_resumed_value_is_returned_by_suspended_call() -> Result<()> {
    let (event_loop, _) = init_event_loop(None)?;
    let received = Rc::new(Cell::new(0));

    let seen = received.clone();
    let evaluation = runtime::start(async move {
        let v: u32 = await_resume().await?;
        seen.set(v);
        Ok(v * 6)
    })?;
    assert!(evaluation.is_waiting());

    evaluation.resume(7_u32)?;
    assert!(!evaluation.is_waiting());
    event_loop.run_once()?;

    assert_eq!(received.get(), 7);
    assert_eq!(evaluation.try_result().transpose()?, Some(42));
    Ok(())
}

#[test]
fn test_timeout_result_value_is_returned() -> Result<()> {
    let (event_loop, _) = init_event_loop(None)?;
    let target = parked("late")?;

    let res = event_loop.block_on(async {
        target
            .await_result_opts(
                AwaitOptions::new()
                    .within(Duration::from_micros(100))
                    .timeout_result(Ok("timed_out")),
            )
            .await
    })?;

    assert_eq!(res?, "timed_out");
    Ok(())
}

#[test]
fn test_timeout_result_error_is_raised() -> Result<()> {
    let (event_loop, _) = init_event_loop(None)?;
    let target = parked("late")?;

    let res = event_loop.block_on(async {
        target
            .await_result_opts(
                AwaitOptions::new()
                    .within(Duration::from_micros(100))
                    .timeout_result(Err(Error::work(anyhow!("too slow")))),
            )
            .await
    })?;

    match res {
        Err(err @ Error::Work(_)) => assert_eq!(err.to_string(), "too slow"),
        other => panic!("expected work error, got {:?}", other),
    }
    Ok(())
}

#[test]
fn test_timeout_is_delivered_only_to_awaiting_call() -> Result<()> {
    let (event_loop, _) = init_event_loop(None)?;
    let target = parked(9_u32)?;

    let (impatient, patient) = (target.clone(), target.clone());
    let impatient = runtime::start(async move {
        impatient
            .await_result_opts(AwaitOptions::new().within(ms(10)))
            .await
    })?;
    let patient = runtime::start(async move { patient.await_result().await })?;

    // Parks until the deadline, then fires the timeout.
    event_loop.run_once()?;
    event_loop.run_once()?;
    assert!(matches!(impatient.try_result(), Some(Err(Error::Timeout(_)))));
    assert!(patient.is_waiting());

    target.resume(())?;
    event_loop.run_once()?;
    event_loop.run_once()?;
    assert_eq!(patient.try_result().transpose()?, Some(9));
    Ok(())
}

#[rstest]
#[case::success(Ok(21), 42)]
#[case::error(Err(Error::cancelled("gone")), -1)]
fn test_await_result_with_transforms_both_outcomes(
    #[case] outcome: crate::Result<i32>,
    #[case] expected: i32,
) -> Result<()> {
    init_event_loop(None)?;
    let evaluation = parked(0_i32)?;
    evaluation.conclude_with(outcome)?;

    let res = evaluation
        .await_result_with(AwaitOptions::new(), |res| Ok(res.map_or(-1, |v| v * 2)))
        .now_or_never();

    assert_eq!(res.transpose()?, Some(expected));
    Ok(())
}

#[test]
fn test_detached_start_cancelled_before_running_never_runs() -> Result<()> {
    let (event_loop, _) = init_event_loop(None)?;
    let ran = Rc::new(Cell::new(false));

    let flag = ran.clone();
    let evaluation = runtime::start_detached(async move {
        flag.set(true);
        Ok(())
    })?;
    assert_eq!(event_loop.stats().immediate_entries, 1);

    evaluation.cancel()?;

    let stats = event_loop.stats();
    assert_eq!(stats.immediate_entries, 0);
    assert_eq!(stats.contexts_idle, stats.contexts_live);

    assert_eq!(event_loop.run_once()?, 0);
    assert!(!ran.get());
    assert!(matches!(evaluation.try_result(), Some(Err(e)) if e.is_cancelled()));
    Ok(())
}

#[test]
fn test_detached_start_runs_when_loop_reaches_it() -> Result<()> {
    let (event_loop, _) = init_event_loop(None)?;

    let evaluation = runtime::start_detached(async { Ok("detached") })?;
    assert!(!evaluation.is_concluded());

    assert_eq!(event_loop.run_once()?, 1);
    assert_eq!(evaluation.try_result().transpose()?, Some("detached"));
    Ok(())
}

#[test]
fn test_cancel_from_nested_start_abandons_at_next_suspension() -> Result<()> {
    let (event_loop, _) = init_event_loop(None)?;
    let log = Rc::new(RefCell::new(Vec::new()));

    let outer_log = log.clone();
    let outer = runtime::start(async move {
        let me = EvaluationRef::current();
        let inner_log = outer_log.clone();

        let inner = runtime::start(async move {
            me.cancel_with("trouble")?;
            inner_log.borrow_mut().push("inner");
            Ok(())
        })?;
        assert!(inner.is_concluded());

        outer_log.borrow_mut().push("outer");
        await_resume::<()>().await?;
        outer_log.borrow_mut().push("unreachable");
        Ok(())
    })?;

    assert_eq!(*log.borrow(), ["inner", "outer"]);
    assert!(matches!(
        outer.try_result(),
        Some(Err(Error::Cancelled(reason))) if reason == "trouble"
    ));

    let stats = event_loop.stats();
    assert_eq!(stats.contexts_idle, stats.contexts_live);
    assert_eq!(stats.contexts_created, 2);
    Ok(())
}

#[test]
fn test_self_cancel_discards_late_outcome() -> Result<()> {
    init_event_loop(None)?;

    let evaluation = runtime::start(async {
        EvaluationRef::current().cancel()?;
        Ok(5_u32)
    })?;

    match evaluation.try_result() {
        Some(Err(Error::Cancelled(reason))) => {
            assert_eq!(reason, crate::error::DEFAULT_CANCEL_REASON)
        }
        other => panic!("expected cancellation, got {:?}", other),
    }
    Ok(())
}

#[test]
fn test_root_evaluation_cannot_be_cancelled() -> Result<()> {
    init_event_loop(None)?;
    let root = EvaluationRef::current();

    assert!(root.is_root());
    assert!(matches!(
        root.cancel(),
        Err(Error::Protocol(ProtocolError::RootEvaluation))
    ));
    Ok(())
}

#[test]
fn test_await_own_result_is_rejected() -> Result<()> {
    let (event_loop, _) = init_event_loop(None)?;
    let slot: Rc<RefCell<Option<Evaluation<u32>>>> = Rc::new(RefCell::new(None));

    let own = slot.clone();
    let evaluation = runtime::start(async move {
        await_resume::<()>().await?;
        let me = own.borrow_mut().take().ok_or_else(|| anyhow!("no handle"))?;
        me.await_result().await
    })?;

    slot.replace(Some(evaluation.clone()));
    evaluation.resume(())?;
    event_loop.run_once()?;

    assert!(matches!(
        evaluation.try_result(),
        Some(Err(Error::Protocol(ProtocolError::AwaitOwnResult)))
    ));
    Ok(())
}

#[test]
fn test_resume_with_unexpected_type_fails_suspended_call() -> Result<()> {
    let (event_loop, _) = init_event_loop(None)?;

    let evaluation = runtime::start(async {
        let v: u32 = await_resume().await?;
        Ok(v)
    })?;

    evaluation.resume("not a number")?;
    event_loop.run_once()?;

    assert!(matches!(
        evaluation.try_result(),
        Some(Err(Error::Protocol(ProtocolError::UnexpectedValue { .. })))
    ));
    Ok(())
}

#[test]
fn test_joined_suspensions_in_one_evaluation() -> Result<()> {
    let (event_loop, _) = init_event_loop(None)?;

    let evaluation = runtime::start(async {
        let (first, second) = futures::join!(await_resume::<u32>(), await_resume::<u32>());
        Ok((first?, second.err().and_then(|e| e.protocol())))
    })?;

    evaluation.resume(3_u32)?;
    event_loop.run_once()?;

    assert_eq!(
        evaluation.try_result().transpose()?,
        Some((3, Some(ProtocolError::AlreadyWaiting)))
    );
    Ok(())
}

#[test]
fn test_panicking_work_concludes_with_panic_error() -> Result<()> {
    let (event_loop, _) = init_event_loop(None)?;

    let evaluation = runtime::start(async {
        if true {
            panic!("boom");
        }
        Ok(())
    })?;

    assert!(matches!(
        evaluation.try_result(),
        Some(Err(Error::Panicked(msg))) if msg == "boom"
    ));

    let stats = event_loop.stats();
    assert_eq!(stats.contexts_idle, stats.contexts_live);
    Ok(())
}

#[test]
fn test_work_errors_are_stored_not_propagated() -> Result<()> {
    init_event_loop(None)?;

    fn flaky() -> Result<()> {
        Err(anyhow!("disk on fire"))
    }

    let evaluation = runtime::start(async {
        flaky()?;
        Ok(())
    })?;

    match evaluation.try_result() {
        Some(Err(err @ Error::Work(_))) => assert_eq!(err.to_string(), "disk on fire"),
        other => panic!("expected work error, got {:?}", other),
    }
    Ok(())
}

#[rstest]
#[case::elapses(false, ms(25))]
#[case::resumed_early(true, Duration::ZERO)]
fn test_wait(#[case] resume_early: bool, #[case] elapsed: Duration) -> Result<()> {
    let (event_loop, driver) = init_event_loop(None)?;

    let evaluation = runtime::start(async {
        wait(ms(25)).await?;
        Ok(())
    })?;

    if resume_early {
        evaluation.resume(())?;
    }

    while !evaluation.is_concluded() {
        event_loop.run_once()?;
    }

    assert!(evaluation.try_result().transpose()?.is_some());
    assert_eq!(driver.elapsed(), elapsed);
    Ok(())
}

#[test]
fn test_operations_on_torn_down_generation_fail() -> Result<()> {
    init_event_loop(Some(Builder::new().prealloc_contexts(2)))?;
    let evaluation = parked(1_u32)?;

    let fresh = runtime::reinitialize();

    assert!(matches!(evaluation.resume(()), Err(Error::Teardown { cause: None })));
    assert!(matches!(evaluation.cancel(), Err(e) if e.is_teardown()));
    assert!(matches!(evaluation.try_result(), Some(Err(e)) if e.is_teardown()));

    let res = evaluation.await_result().now_or_never();
    assert!(matches!(res, Some(Err(e)) if e.is_teardown()));

    // The fresh loop keeps the configuration and serves new work.
    assert_eq!(fresh.stats().contexts_idle, 2);
    let next = runtime::start(async { Ok(2_u32) })?;
    assert_eq!(next.try_result().transpose()?, Some(2));
    Ok(())
}
