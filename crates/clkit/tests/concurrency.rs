mod common;

use clkit::source::LoadCallback;
use clkit::{
    Buffer, BufferOptions, ContextOptions, MockProvider, Releasable, Session, SessionConfig, SourceLoader,
};
use std::sync::{Arc, Barrier};
use std::thread;

/// Holds every load until the test lets it through.
struct GatedLoader {
    entered: Barrier,
    resume: Barrier,
}

impl GatedLoader {
    fn new() -> Self {
        Self { entered: Barrier::new(2), resume: Barrier::new(2) }
    }
}

impl SourceLoader for GatedLoader {
    fn load(&self, _uri: &str) -> clkit::Result<String> {
        self.entered.wait();
        self.resume.wait();
        Ok("__kernel void slow(__global int* data) {}".to_owned())
    }

    fn load_async(&self, uri: &str, callback: LoadCallback) -> clkit::Result<()> {
        callback(self.load(uri).ok());
        Ok(())
    }
}

#[test]
fn failure_cleans_up_while_another_thread_is_inside_the_context() {
    let provider = Arc::new(MockProvider::new());
    let loader = Arc::new(GatedLoader::new());
    let cl = Session::with_loader(provider.clone(), loader.clone(), SessionConfig::default()).unwrap();
    let ctx = cl.create_context(ContextOptions::default()).unwrap();
    let a = common::buffer(&ctx, "a", 64);

    thread::scope(|s| {
        let slow = s.spawn(|| ctx.create_program("slow.cl"));
        loader.entered.wait();

        provider.fail_on("create_buffer");
        let err = ctx.create_buffer(BufferOptions::default().name("b")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Context.create_buffer: provider error -5: OUT_OF_RESOURCES (injected in create_buffer)"
        );
        assert!(a.is_released());
        assert!(ctx.buffers().is_empty());

        loader.resume.wait();
        let program = slow.join().unwrap().unwrap();
        assert!(!program.is_released());
    });
    assert_eq!(ctx.programs().len(), 1);
}

#[test]
fn racing_inserts_under_one_name_leave_a_single_live_entry() {
    let (provider, cl) = common::session();
    let ctx = common::gpu_context(&cl);
    let before = provider.live_handles();

    let buffers: Vec<Arc<Buffer>> = thread::scope(|s| {
        let workers: Vec<_> = (0..8).map(|_| s.spawn(|| common::buffer(&ctx, "shared", 16))).collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    assert_eq!(ctx.buffers().len(), 1);
    let live: Vec<&Arc<Buffer>> = buffers.iter().filter(|b| !b.is_released()).collect();
    assert_eq!(live.len(), 1);
    assert!(Arc::ptr_eq(live[0], &ctx.get_buffer("shared").unwrap()));
    assert_eq!(provider.live_handles(), before + 1);
}

#[test]
fn concurrent_failures_on_separate_contexts_stay_separate() {
    let (provider, cl) = common::session();
    let left = common::gpu_context(&cl);
    let right = common::gpu_context(&cl);
    let keep = common::buffer(&right, "keep", 16);

    provider.fail_on("create_image");
    thread::scope(|s| {
        let failing = s.spawn(|| left.create_image(clkit::ImageOptions::default()));
        let fine = s.spawn(|| right.create_buffer(BufferOptions::default().name("more")));
        let err = failing.join().unwrap().unwrap_err();
        assert!(err.to_string().starts_with("Context.create_image: "));
        fine.join().unwrap().unwrap();
    });
    assert!(!keep.is_released());
    assert_eq!(right.buffers().len(), 2);
}
