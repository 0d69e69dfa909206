#![allow(dead_code)]

use clkit::{
    BufferOptions, Context, ContextOptions, FileSourceLoader, MockProvider, Session, SessionConfig,
};
use std::path::PathBuf;
use std::sync::Arc;

pub fn kernels_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests")
}

/// A session over a fresh mock provider, loading `kernels/*.cl` from the test tree.
pub fn session_with(config: SessionConfig) -> (Arc<MockProvider>, Session) {
    let provider = Arc::new(MockProvider::new());
    let loader = Arc::new(FileSourceLoader::new(kernels_root()));
    let session = Session::with_loader(provider.clone(), loader, config).unwrap();
    (provider, session)
}

pub fn session() -> (Arc<MockProvider>, Session) {
    session_with(SessionConfig::default())
}

/// A context on the mock GPU.
pub fn gpu_context(session: &Session) -> Arc<Context> {
    let gpu = session.device("GPU0").unwrap();
    session.create_context(ContextOptions::default().device(&gpu)).unwrap()
}

pub fn buffer(ctx: &Context, name: &str, size: usize) -> Arc<clkit::Buffer> {
    ctx.create_buffer(BufferOptions::default().name(name).size(size)).unwrap()
}
