mod common;

use std::cell::RefCell;
use std::rc::Rc;

use serde_json::{json, Value as JsonValue};

use common::{test_env, FakeTarget, MapTransport};
use mosaic::scope::ScopeCallback;
use mosaic::{
    register_micro_app, AppConfig, Environment, IsolationMode, MicroApp, SourceOptions,
    SourceProvider,
};

const APP_HTML: &str = "<html><head></head><body><div>app</div></body></html>";

fn recorder() -> (ScopeCallback, Rc<RefCell<Vec<JsonValue>>>) {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    let callback: ScopeCallback = Rc::new(move |data: &JsonValue| {
        sink.borrow_mut().push(data.clone());
    });
    (callback, seen)
}

async fn boot_app(env: &Rc<Environment>, name: &str, locator: &str) -> (Rc<MicroApp>, Rc<FakeTarget>) {
    let source = env.import_source(locator, SourceOptions::default());
    let app = register_micro_app(
        env,
        AppConfig::new(name, IsolationMode::ProxyVm, SourceProvider::Handle(source)),
    );
    let target = FakeTarget::new();
    env.register_mount_target(name, Rc::clone(&target) as Rc<dyn mosaic::MountTarget>);
    app.bootstrap(false).await.expect("bootstrap");
    (app, target)
}

#[tokio::test]
async fn emit_reaches_the_watched_sibling_only() {
    let transport = MapTransport::new(&[
        ("/a/index.html", APP_HTML),
        ("/b/index.html", APP_HTML),
    ]);
    let env = test_env(transport);
    let root = env.root_scope();

    let (a, _ta) = boot_app(&env, "A", "/a/index.html").await;
    let (_b, _tb) = boot_app(&env, "B", "/b/index.html").await;

    let (watch_a, seen_a) = recorder();
    let (watch_b, seen_b) = recorder();
    root.watch("A", watch_a);
    root.watch("B", watch_b);

    a.scope().expect("scope A").emit(&json!({"msg": 1}));

    assert_eq!(*seen_a.borrow(), vec![json!({"msg": 1})]);
    assert!(seen_b.borrow().is_empty());
}

#[tokio::test]
async fn watch_listeners_die_with_the_child() {
    let transport = MapTransport::new(&[("/a/index.html", APP_HTML)]);
    let env = test_env(transport);
    let root = env.root_scope();

    let (a, target) = boot_app(&env, "A", "/a/index.html").await;
    let (callback, seen) = recorder();
    root.watch("A", callback);

    let stale = a.scope().expect("scope A");
    target.destroy();

    // Triggering through a lingering reference to the old node is inert.
    stale.emit(&json!({"late": true}));
    assert!(seen.borrow().is_empty());
    assert!(root.find_app("A").is_none());
    assert_eq!(a.state(), mosaic::AppState::Destroyed);
}

#[tokio::test]
async fn send_and_dispatch_address_direct_children() {
    let transport = MapTransport::new(&[
        ("/a/index.html", APP_HTML),
        ("/b/index.html", APP_HTML),
    ]);
    let env = test_env(transport);
    let root = env.root_scope();

    let (a, _ta) = boot_app(&env, "A", "/a/index.html").await;
    let (b, _tb) = boot_app(&env, "B", "/b/index.html").await;

    let (listen_a, seen_a) = recorder();
    let (listen_b, seen_b) = recorder();
    a.scope().expect("scope A").listen(listen_a);
    b.scope().expect("scope B").listen(listen_b);

    root.send("A", &json!("only a"));
    assert_eq!(*seen_a.borrow(), vec![json!("only a")]);
    assert!(seen_b.borrow().is_empty());

    root.dispatch(&json!("everyone"));
    assert_eq!(seen_a.borrow().len(), 2);
    assert_eq!(*seen_b.borrow(), vec![json!("everyone")]);
}

#[tokio::test]
async fn broadcast_descends_depth_first_from_the_root() {
    let transport = MapTransport::new(&[
        ("/a/index.html", APP_HTML),
        ("/b/index.html", APP_HTML),
        ("/c/index.html", APP_HTML),
    ]);
    let env = test_env(transport);

    let (a, _ta) = boot_app(&env, "A", "/a/index.html").await;
    let (b, _tb) = boot_app(&env, "B", "/b/index.html").await;

    // C registers while A's scope is the registration context, so it nests
    // under A rather than the root.
    let nested = {
        let _pin = env.pin_scope(a.scope().expect("scope A"));
        let source = env.import_source("/c/index.html", SourceOptions::default());
        register_micro_app(
            &env,
            AppConfig::new("C", IsolationMode::ProxyVm, SourceProvider::Handle(source)),
        )
    };
    let target = FakeTarget::new();
    env.register_mount_target("C", Rc::clone(&target) as Rc<dyn mosaic::MountTarget>);
    nested.bootstrap(false).await.expect("bootstrap C");

    assert!(a.scope().expect("scope A").find_app("C").is_some());
    assert!(env.root_scope().find_app("C").is_none());

    let (listen_b, seen_b) = recorder();
    let (listen_c, seen_c) = recorder();
    b.scope().expect("scope B").listen(listen_b);
    nested.scope().expect("scope C").listen(listen_c);

    // Broadcast starts at the root regardless of which node it is called on.
    nested.scope().expect("scope C").broadcast(&json!({"tick": 1}));

    assert_eq!(*seen_b.borrow(), vec![json!({"tick": 1})]);
    assert_eq!(*seen_c.borrow(), vec![json!({"tick": 1})]);
}

#[tokio::test]
async fn on_message_receives_upward_messages() {
    let transport = MapTransport::new(&[("/a/index.html", APP_HTML)]);
    let env = test_env(transport);

    let (callback, seen) = recorder();
    let source = env.import_source("/a/index.html", SourceOptions::default());
    let mut config = AppConfig::new("A", IsolationMode::ProxyVm, SourceProvider::Handle(source));
    config.on_message = Some(callback);
    let app = register_micro_app(&env, config);

    let target = FakeTarget::new();
    env.register_mount_target("A", Rc::clone(&target) as Rc<dyn mosaic::MountTarget>);
    app.bootstrap(false).await.expect("bootstrap");

    app.scope().expect("scope").emit(&json!({"ready": true}));
    assert_eq!(*seen.borrow(), vec![json!({"ready": true})]);
}

#[tokio::test]
async fn urlchange_events_surface_on_the_app_scope() {
    let transport = MapTransport::new(&[("/a/index.html", APP_HTML)]);
    let env = test_env(transport);

    let (app, target) = boot_app(&env, "A", "/a/index.html").await;
    let (callback, seen) = recorder();
    app.scope().expect("scope").on("urlchange", callback);

    target.emit_urlchange(json!({"pathname": "/a/detail", "type": "change:pushState"}));
    assert_eq!(seen.borrow().len(), 1);
    assert_eq!(seen.borrow()[0]["pathname"], json!("/a/detail"));
}
