mod common;

use std::sync::{Arc, Mutex};

use common::*;
use onion_napi::{
    abi::promise::*,
    onion_host::{HostValue, PromiseState, Rooted},
    HandleId, Status,
};

fn create_promise(worker: &mut onion_napi::Worker, env: u32) -> (u32, HandleId) {
    assert_eq!(napi_create_promise(worker, env, OUT, OUT2), Status::Ok);
    let deferred = read_u32(worker, env, OUT);
    let promise = HandleId::from_raw(read_u32(worker, env, OUT2));
    (deferred, promise)
}

#[test]
fn deferred_settles_once() {
    let (mut worker, env) = setup();
    let (deferred, promise) = create_promise(&mut worker, env);
    let value = active(&mut worker, env).create_number(5.0).unwrap();

    assert_eq!(
        napi_resolve_deferred(&mut worker, env, deferred, value.as_raw()),
        Status::Ok
    );
    assert_eq!(
        napi_resolve_deferred(&mut worker, env, deferred, value.as_raw()),
        Status::InvalidArg
    );
    assert_eq!(
        napi_reject_deferred(&mut worker, env, deferred, value.as_raw()),
        Status::InvalidArg
    );

    let mut active = active(&mut worker, env);
    let promise = active.get_handle(promise).unwrap();
    assert!(matches!(
        active.realm().promise_state(&promise).unwrap(),
        PromiseState::Fulfilled(HostValue::Number(n)) if n == 5.0
    ));
}

#[test]
fn unknown_deferred_is_an_invalid_argument() {
    let (mut worker, env) = setup();
    let value = active(&mut worker, env).create_number(1.0).unwrap();
    assert_eq!(
        napi_reject_deferred(&mut worker, env, 4242, value.as_raw()),
        Status::InvalidArg
    );
    assert_eq!(
        napi_resolve_deferred(&mut worker, env, 0, value.as_raw()),
        Status::InvalidArg
    );
}

#[test]
fn invalid_value_keeps_the_deferred_usable() {
    let (mut worker, env) = setup();
    let (deferred, _) = create_promise(&mut worker, env);
    assert_eq!(
        napi_resolve_deferred(&mut worker, env, deferred, 9999),
        Status::InvalidArg
    );
    assert_eq!(
        napi_resolve_deferred(&mut worker, env, deferred, HandleId::TRUE.as_raw()),
        Status::Ok
    );
}

#[test]
fn reactions_run_as_microtasks() {
    let (mut worker, env) = setup();
    let (deferred, promise) = create_promise(&mut worker, env);
    let seen = Arc::new(Mutex::new(Vec::new()));

    // 反应只弱引用处理函数，测试期间保持它们存活
    let _keep = {
        let mut active = active(&mut worker, env);
        let promise = active.get_handle(promise).unwrap();
        let record = seen.clone();
        let realm = active.realm();
        let handler = realm.create_function("record", move |_, _, args| {
            if let Some(HostValue::Number(n)) = args.first() {
                record.lock().unwrap().push(*n);
            }
            Ok(Rooted::undefined())
        });
        let (derived, jobs) = realm.then(&promise, Some(&handler), None).unwrap();
        assert!(jobs.is_empty());
        (handler, derived)
    };

    let value = active(&mut worker, env).create_number(7.0).unwrap();
    assert_eq!(
        napi_resolve_deferred(&mut worker, env, deferred, value.as_raw()),
        Status::Ok
    );
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(worker.run_until_idle(), 1);
    assert_eq!(*seen.lock().unwrap(), vec![7.0]);
}

#[test]
fn rejection_reaches_the_rejection_handler() {
    let (mut worker, env) = setup();
    let (deferred, promise) = create_promise(&mut worker, env);
    let rejected = Arc::new(Mutex::new(false));

    let _keep = {
        let mut active = active(&mut worker, env);
        let promise = active.get_handle(promise).unwrap();
        let flag = rejected.clone();
        let realm = active.realm();
        let handler = realm.create_function("onRejected", move |_, _, _| {
            *flag.lock().unwrap() = true;
            Ok(Rooted::undefined())
        });
        let (derived, _) = realm.then(&promise, None, Some(&handler)).unwrap();
        (handler, derived)
    };

    let reason = active(&mut worker, env).create_string("nope").unwrap();
    assert_eq!(
        napi_reject_deferred(&mut worker, env, deferred, reason.as_raw()),
        Status::Ok
    );
    worker.run_until_idle();
    assert!(*rejected.lock().unwrap());
}

#[test]
fn is_promise_distinguishes_promises() {
    let (mut worker, env) = setup();
    let (_, promise) = create_promise(&mut worker, env);
    let object = active(&mut worker, env).create_object().unwrap();

    assert_eq!(napi_is_promise(&mut worker, env, promise.as_raw(), OUT), Status::Ok);
    assert_eq!(read_u8(&mut worker, env, OUT), 1);
    assert_eq!(napi_is_promise(&mut worker, env, object.as_raw(), OUT), Status::Ok);
    assert_eq!(read_u8(&mut worker, env, OUT), 0);
    assert_eq!(napi_is_promise(&mut worker, env, object.as_raw(), 0), Status::InvalidArg);
}

#[test]
fn create_promise_is_blocked_by_a_pending_exception() {
    let (mut worker, env) = setup();
    let value = active(&mut worker, env).create_number(1.0).unwrap();
    onion_napi::abi::error::napi_throw(&mut worker, env, value.as_raw());
    assert_eq!(
        napi_create_promise(&mut worker, env, OUT, OUT2),
        Status::PendingException
    );
    assert_eq!(napi_create_promise(&mut worker, env, 0, OUT2), Status::PendingException);
}
