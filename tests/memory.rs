mod common;

use common::*;
use onion_napi::{
    abi::{memory::*, AUTO_LENGTH},
    onion_env::Ownership,
    HandleId, Status, ViewKind,
};

#[test]
fn copy_in_is_stable_until_detached() {
    let (mut worker, env) = setup();
    let mut active = active(&mut worker, env);
    let bytes: Vec<u8> = (0..200u8).collect();
    let buffer = active.create_array_buffer(&bytes).unwrap();

    let first = active.get_array_buffer_pointer(buffer, true).unwrap();
    assert_ne!(first.address, 0);
    assert!(first.address >= 1024);
    assert_eq!(first.ownership, Ownership::Runtime);
    assert_eq!(active.memory().read(first.address, 200).unwrap(), bytes);

    let second = active.get_array_buffer_pointer(buffer, true).unwrap();
    assert_eq!(second.address, first.address);

    active.detach_array_buffer(buffer).unwrap();
    assert!(active.is_detached(buffer).unwrap());
    assert_eq!(active.get_array_buffer_pointer(buffer, true).unwrap().address, 0);
}

#[test]
fn no_copy_requested_means_no_address() {
    let (mut worker, env) = setup();
    let mut active = active(&mut worker, env);
    let buffer = active.create_array_buffer(&[1, 2, 3]).unwrap();
    assert_eq!(active.get_array_buffer_pointer(buffer, false).unwrap().address, 0);
    assert_eq!(active.memory().read(1024, 3).unwrap(), vec![0, 0, 0]);
}

#[test]
fn detaching_a_non_buffer_is_rejected() {
    let (mut worker, env) = setup();
    let mut active = active(&mut worker, env);
    let object = active.create_object().unwrap();
    assert!(matches!(
        active.detach_array_buffer(object),
        Err(onion_napi::NapiError::Expected(Status::DetachableArraybufferExpected))
    ));
}

#[test]
fn memory_view_is_rebound_after_growth() {
    let (mut worker, env) = setup();
    assert_eq!(
        emnapi_create_memory_view(&mut worker, env, 5, 900, 16, OUT),
        Status::Ok
    );
    let view = HandleId::from_raw(read_u32(&mut worker, env, OUT));

    let mut active = active(&mut worker, env);
    active.memory().write_i32(904, -7).unwrap();
    let pages_before = active.memory().pages().unwrap();

    // 拷入一个超过一页的 buffer，迫使线性内存增长
    let large = active.create_array_buffer(&vec![0xAB; 70_000]).unwrap();
    let copy = active.get_array_buffer_pointer(large, true).unwrap();
    assert_ne!(copy.address, 0);
    assert!(active.memory().pages().unwrap() > pages_before);

    let (fresh, pointer) = active.get_view_pointer(view, false).unwrap();
    assert_ne!(fresh, view);
    assert_eq!(pointer.address, 900);

    let fresh = active.get_handle(fresh).unwrap();
    let realm = active.realm();
    let info = realm.view_info(&fresh).unwrap();
    assert_eq!(info.kind, ViewKind::Int32);
    assert_eq!(info.length, 4);
    assert_eq!(info.byte_offset, 900);
    assert_eq!(&realm.read_bytes(&fresh).unwrap()[4..8], &(-7i32).to_le_bytes());
}

#[test]
fn memory_address_reports_ownership() {
    let (mut worker, env) = setup();
    let buffer = active(&mut worker, env).create_array_buffer(&[7; 32]).unwrap();

    assert_eq!(
        emnapi_get_memory_address(&mut worker, env, buffer.as_raw(), OUT, OUT2, OUT3),
        Status::Ok
    );
    assert_eq!(read_u32(&mut worker, env, OUT), 0);
    assert_eq!(read_u8(&mut worker, env, OUT3), 0);

    let copied = active(&mut worker, env)
        .get_array_buffer_pointer(buffer, true)
        .unwrap();
    assert_eq!(
        emnapi_get_memory_address(&mut worker, env, buffer.as_raw(), OUT, OUT2, OUT3),
        Status::Ok
    );
    assert_eq!(read_u32(&mut worker, env, OUT) as usize, copied.address);
    assert_eq!(read_u32(&mut worker, env, OUT2), Ownership::Runtime as u32);
    assert_eq!(read_u8(&mut worker, env, OUT3), 1);

    // 输出参数全部可选
    assert_eq!(
        emnapi_get_memory_address(&mut worker, env, buffer.as_raw(), 0, 0, 0),
        Status::Ok
    );
    let object = active(&mut worker, env).create_object().unwrap();
    assert_eq!(
        emnapi_get_memory_address(&mut worker, env, object.as_raw(), OUT, 0, 0),
        Status::InvalidArg
    );
}

#[test]
fn view_address_includes_its_offset() {
    let (mut worker, env) = setup();
    let mut active = active(&mut worker, env);
    let buffer = active.create_array_buffer(&[3; 64]).unwrap();
    let view = active.create_view(ViewKind::Uint8, buffer, 16, 8).unwrap();
    let (same, pointer) = active.get_view_pointer(view, true).unwrap();
    let base = active.get_array_buffer_pointer(buffer, false).unwrap();
    assert_eq!(pointer.address, base.address + 16);
    assert!(active
        .get_handle(same)
        .unwrap()
        .is_same(&active.get_handle(view).unwrap()));
}

#[test]
fn sync_copies_in_both_directions() {
    let (mut worker, env) = setup();
    let (buffer, address) = {
        let mut active = active(&mut worker, env);
        let buffer = active.create_array_buffer(&[1, 2, 3, 4]).unwrap();
        let pointer = active.get_array_buffer_pointer(buffer, true).unwrap();
        active.memory().write(pointer.address + 1, &[20, 30]).unwrap();
        (buffer, pointer.address)
    };

    assert_eq!(
        emnapi_sync_memory(&mut worker, env, false, buffer.as_raw(), 1, 2, OUT),
        Status::Ok
    );
    assert_eq!(read_u32(&mut worker, env, OUT), buffer.as_raw());
    {
        let mut active = active(&mut worker, env);
        let rooted = active.get_handle(buffer).unwrap();
        assert_eq!(active.realm().read_bytes(&rooted).unwrap(), vec![1, 20, 30, 4]);
        active.realm().write_bytes(&rooted, 3, &[40]).unwrap();
    }

    assert_eq!(
        emnapi_sync_memory(&mut worker, env, true, buffer.as_raw(), 0, AUTO_LENGTH, 0),
        Status::Ok
    );
    let active = active(&mut worker, env);
    assert_eq!(active.memory().read(address, 4).unwrap(), vec![1, 20, 30, 40]);
}

#[test]
fn sync_rejects_out_of_range_and_untracked_values() {
    let (mut worker, env) = setup();
    let (tracked, untracked) = {
        let mut active = active(&mut worker, env);
        let tracked = active.create_array_buffer(&[0; 8]).unwrap();
        active.get_array_buffer_pointer(tracked, true).unwrap();
        (tracked, active.create_array_buffer(&[0; 8]).unwrap())
    };
    assert_eq!(
        emnapi_sync_memory(&mut worker, env, true, tracked.as_raw(), 4, 8, 0),
        Status::InvalidArg
    );
    assert_eq!(
        emnapi_sync_memory(&mut worker, env, true, untracked.as_raw(), 0, AUTO_LENGTH, 0),
        Status::InvalidArg
    );
}

#[test]
fn create_memory_view_validates_arguments() {
    let (mut worker, env) = setup();
    assert_eq!(
        emnapi_create_memory_view(&mut worker, env, 11, 900, 8, OUT),
        Status::InvalidArg
    );
    assert_eq!(
        emnapi_create_memory_view(&mut worker, env, 1, 0, 8, OUT),
        Status::InvalidArg
    );
    assert_eq!(
        emnapi_create_memory_view(&mut worker, env, -1, 900, 8, 0),
        Status::InvalidArg
    );
    assert_eq!(
        emnapi_create_memory_view(&mut worker, env, -2, 900, 8, OUT),
        Status::Ok
    );
    assert_eq!(view_kind(-1), Some(ViewKind::DataView));
    assert_eq!(view_kind(-3), None);
}
