mod common;

use common::*;
use onion_napi::{abi::scope::*, HandleId, Status};

#[test]
fn nested_scopes_release_only_what_they_own() {
    let (mut worker, env) = setup();

    assert_eq!(napi_open_handle_scope(&mut worker, env, OUT), Status::Ok);
    let outer = read_u32(&mut worker, env, OUT);
    let kept = active(&mut worker, env).create_object().unwrap();

    assert_eq!(napi_open_escapable_handle_scope(&mut worker, env, OUT), Status::Ok);
    let inner = read_u32(&mut worker, env, OUT);
    let escapee = active(&mut worker, env).create_object().unwrap();
    let dropped = active(&mut worker, env).create_object().unwrap();

    assert_eq!(
        napi_escape_handle(&mut worker, env, inner, escapee.as_raw(), OUT2),
        Status::Ok
    );
    assert_eq!(read_u32(&mut worker, env, OUT2), escapee.as_raw());
    assert_eq!(napi_close_escapable_handle_scope(&mut worker, env, inner), Status::Ok);

    {
        let active = active(&mut worker, env);
        let handles = active.env().handles();
        assert!(handles.is_live(kept));
        assert!(handles.is_live(escapee));
        assert!(!handles.is_live(dropped));
        assert_eq!(handles.live_count(), 2);
    }

    assert_eq!(napi_close_handle_scope(&mut worker, env, outer), Status::Ok);
    let active = active(&mut worker, env);
    assert_eq!(active.env().handles().live_count(), 0);
    assert!(active.get_handle(escapee).is_err());
}

#[test]
fn closing_out_of_order_is_a_scope_mismatch() {
    let (mut worker, env) = setup();
    napi_open_handle_scope(&mut worker, env, OUT);
    let outer = read_u32(&mut worker, env, OUT);
    napi_open_handle_scope(&mut worker, env, OUT);
    let inner = read_u32(&mut worker, env, OUT);

    assert_eq!(
        napi_close_handle_scope(&mut worker, env, outer),
        Status::HandleScopeMismatch
    );
    assert_eq!(napi_close_handle_scope(&mut worker, env, inner), Status::Ok);
    assert_eq!(napi_close_handle_scope(&mut worker, env, outer), Status::Ok);
    // 只剩根作用域
    assert_eq!(
        napi_close_handle_scope(&mut worker, env, outer),
        Status::HandleScopeMismatch
    );
    assert_eq!(napi_close_handle_scope(&mut worker, env, 1), Status::HandleScopeMismatch);
}

#[test]
fn escape_is_allowed_once() {
    let (mut worker, env) = setup();
    napi_open_escapable_handle_scope(&mut worker, env, OUT);
    let scope = read_u32(&mut worker, env, OUT);
    let a = active(&mut worker, env).create_object().unwrap();
    let b = active(&mut worker, env).create_object().unwrap();

    assert_eq!(napi_escape_handle(&mut worker, env, scope, a.as_raw(), OUT2), Status::Ok);
    assert_eq!(
        napi_escape_handle(&mut worker, env, scope, b.as_raw(), OUT2),
        Status::EscapeCalledTwice
    );
}

#[test]
fn escape_after_close_fails() {
    let (mut worker, env) = setup();
    napi_open_escapable_handle_scope(&mut worker, env, OUT);
    let scope = read_u32(&mut worker, env, OUT);
    let value = active(&mut worker, env).create_object().unwrap();
    napi_close_escapable_handle_scope(&mut worker, env, scope);

    assert_eq!(
        napi_escape_handle(&mut worker, env, scope, value.as_raw(), OUT2),
        Status::InvalidArg
    );
}

#[test]
fn escaping_from_a_plain_scope_is_rejected() {
    let (mut worker, env) = setup();
    napi_open_handle_scope(&mut worker, env, OUT);
    let scope = read_u32(&mut worker, env, OUT);
    let value = active(&mut worker, env).create_object().unwrap();
    assert_eq!(
        napi_escape_handle(&mut worker, env, scope, value.as_raw(), OUT2),
        Status::InvalidArg
    );
}

#[test]
fn reserved_handles_survive_every_scope() {
    let (mut worker, env) = setup();
    napi_open_handle_scope(&mut worker, env, OUT);
    let scope = read_u32(&mut worker, env, OUT);
    napi_close_handle_scope(&mut worker, env, scope);
    let active = active(&mut worker, env);
    for id in [
        HandleId::UNDEFINED,
        HandleId::NULL,
        HandleId::FALSE,
        HandleId::TRUE,
        HandleId::GLOBAL,
    ] {
        assert!(active.get_handle(id).is_ok());
    }
}

#[test]
fn null_arguments_are_invalid() {
    let (mut worker, env) = setup();
    assert_eq!(napi_open_handle_scope(&mut worker, env, 0), Status::InvalidArg);
    assert_eq!(napi_close_handle_scope(&mut worker, env, 0), Status::InvalidArg);
    assert_eq!(napi_open_handle_scope(&mut worker, 9999, OUT), Status::InvalidArg);
}
