#![allow(dead_code)]

use onion_napi::{onion_env::ActiveEnv, Context, EnvConfig, EnvId, HostFeatures, Worker};

/// 线性内存开头的保留区不参与分配，测试把输出参数放在这里。
pub const OUT: u32 = 64;
pub const OUT2: u32 = 72;
pub const OUT3: u32 = 80;
pub const TEXT: u32 = 256;
pub const TEXT2: u32 = 512;

pub fn config() -> EnvConfig {
    EnvConfig {
        initial_pages: 1,
        maximum_pages: 8,
        reserved_bytes: 1024,
        ..EnvConfig::default()
    }
}

pub fn setup_with(features: HostFeatures) -> (Worker, u32) {
    let mut worker = Worker::primary(Context::new(), features);
    let env = worker.instantiate(&config()).unwrap();
    (worker, env.as_raw())
}

pub fn setup() -> (Worker, u32) {
    setup_with(HostFeatures::default())
}

pub fn active(worker: &mut Worker, env: u32) -> ActiveEnv<'_> {
    worker.activate(EnvId::from_raw(env)).unwrap()
}

pub fn read_u32(worker: &mut Worker, env: u32, ptr: u32) -> u32 {
    active(worker, env).memory().read_u32(ptr as usize).unwrap()
}

pub fn read_u8(worker: &mut Worker, env: u32, ptr: u32) -> u8 {
    active(worker, env).memory().read(ptr as usize, 1).unwrap()[0]
}

pub fn write_str(worker: &mut Worker, env: u32, ptr: u32, text: &str) {
    active(worker, env)
        .memory()
        .write_c_string(ptr as usize, text)
        .unwrap();
}

pub fn read_str(worker: &mut Worker, env: u32, ptr: u32) -> String {
    active(worker, env)
        .memory()
        .read_c_string(ptr as usize, None)
        .unwrap()
}
