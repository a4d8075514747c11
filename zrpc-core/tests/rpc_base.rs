mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use zrpc_core::{CallOptions, Kwargs, ProcError, RpcError, Value, RESERVED_NAMES};

use common::{arg_f64, kwargs_of, register_echo, register_sleep, start_pair, Toy};

#[tokio::test]
async fn echo_round_trips_a_string() {
    let rig = start_pair().await;
    register_echo(&rig.service);

    let reply = rig.client.invoke("echo", vec![json!("Hi there")]).await.unwrap();
    assert_eq!(reply, json!("Hi there"));

    rig.shutdown().await;
}

#[tokio::test]
async fn echo_round_trips_structured_values() {
    let rig = start_pair().await;
    register_echo(&rig.service);

    let value = json!({"list": [1, 2.5, "three", null], "nested": {"ok": true}});
    let reply = rig.client.invoke("echo", vec![value.clone()]).await.unwrap();
    assert_eq!(reply, value);

    rig.shutdown().await;
}

#[tokio::test]
async fn positional_arguments_arrive_positionally() {
    let rig = start_pair().await;
    rig.service
        .register_fn("mul", |args, kwargs| {
            // a positional invocation must carry no keywords
            if !kwargs.is_empty() {
                return Err(ProcError::new("TypeError", "unexpected keyword arguments"));
            }
            let product = args
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0))
                .product::<f64>();
            Ok(json!(product))
        })
        .unwrap();

    let reply = rig
        .client
        .invoke("mul", vec![json!(7), json!(3), json!(10)])
        .await
        .unwrap();
    assert_eq!(reply, json!(210.0));

    rig.shutdown().await;
}

#[tokio::test]
async fn keyword_arguments_arrive_by_name() {
    let rig = start_pair().await;
    rig.service
        .register_fn("area", |_args, kwargs| {
            let get = |key: &str| {
                kwargs
                    .get(key)
                    .and_then(Value::as_f64)
                    .ok_or_else(|| ProcError::new("TypeError", format!("missing keyword '{key}'")))
            };
            Ok(json!(get("width")? * get("height")?))
        })
        .unwrap();

    let reply = rig
        .client
        .call(
            "area",
            vec![],
            kwargs_of(&[("width", json!(7)), ("height", json!(3))]),
            CallOptions::default(),
        )
        .await
        .unwrap()
        .into_value()
        .unwrap();
    assert_eq!(reply, json!(21.0));

    rig.shutdown().await;
}

#[tokio::test]
async fn remote_errors_carry_the_descriptor() {
    let rig = start_pair().await;
    rig.service
        .register_fn("error", |_args, _kwargs| -> Result<Value, ProcError> {
            Err(ProcError::new("ValueError", "raising ValueError for fun!"))
        })
        .unwrap();

    let err = rig.client.invoke("error", vec![]).await.unwrap_err();
    match err {
        RpcError::Remote(remote) => {
            assert_eq!(remote.ename, "ValueError");
            assert_eq!(remote.evalue, "raising ValueError for fun!");
            assert!(!remote.traceback.is_empty());
        }
        other => panic!("expected a remote error, got {other:?}"),
    }

    rig.shutdown().await;
}

#[tokio::test]
async fn unregistered_procedure_fails_remotely() {
    let rig = start_pair().await;

    let err = rig.client.invoke("missing", vec![]).await.unwrap_err();
    match err {
        RpcError::Remote(remote) => {
            assert_eq!(remote.ename, "NotImplementedError");
            assert_eq!(remote.evalue, "Unregistered procedure 'missing'");
        }
        other => panic!("expected a remote error, got {other:?}"),
    }

    rig.shutdown().await;
}

#[tokio::test]
async fn reserved_names_cannot_be_registered_and_stay_unreachable() {
    let rig = start_pair().await;

    for name in RESERVED_NAMES {
        let err = rig
            .service
            .register_fn(name, |_args, _kwargs| Ok(Value::Null))
            .unwrap_err();
        assert!(
            err.to_string().contains(name),
            "error {err} does not mention {name}"
        );
    }
    assert!(rig.service.registry().is_empty());

    // the non-command reserved names are also unreachable over the wire
    let err = rig.client.invoke("serve", vec![]).await.unwrap_err();
    match err {
        RpcError::Remote(remote) => {
            assert_eq!(remote.ename, "NotImplementedError");
        }
        other => panic!("expected a remote error, got {other:?}"),
    }

    rig.shutdown().await;
}

#[tokio::test]
async fn registered_objects_expose_public_methods_only() {
    let rig = start_pair().await;
    rig.service.register_object(&Toy { value: 12 }, None, &[]);

    let reply = rig.client.invoke("value", vec![]).await.unwrap();
    assert_eq!(reply, json!(12));

    let err = rig.client.invoke("_private", vec![]).await.unwrap_err();
    assert!(matches!(err, RpcError::Remote(remote) if remote.ename == "NotImplementedError"));

    rig.shutdown().await;
}

#[tokio::test]
async fn restricted_methods_are_not_exposed() {
    let rig = start_pair().await;
    rig.service
        .register_object(&Toy { value: 12 }, None, &["restricted"]);

    let err = rig.client.invoke("restricted", vec![]).await.unwrap_err();
    assert!(matches!(err, RpcError::Remote(remote) if remote.ename == "NotImplementedError"));

    rig.shutdown().await;
}

#[tokio::test]
async fn namespaced_objects_answer_under_their_prefix_only() {
    let rig = start_pair().await;
    for (i, ns) in ["a", "b", "c"].into_iter().enumerate() {
        rig.service
            .register_object(&Toy { value: i as i64 }, Some(ns), &[]);
    }

    for (i, ns) in ["a", "b", "c"].into_iter().enumerate() {
        let reply = rig
            .client
            .invoke(&format!("{ns}.value"), vec![])
            .await
            .unwrap();
        assert_eq!(reply, json!(i));
    }

    let err = rig.client.invoke("value", vec![]).await.unwrap_err();
    assert!(matches!(err, RpcError::Remote(remote) if remote.ename == "NotImplementedError"));

    rig.shutdown().await;
}

#[tokio::test]
async fn deep_namespaces_resolve_through_the_proxy() {
    let rig = start_pair().await;
    rig.service
        .register_object(&Toy { value: 12 }, Some("this.has.a.toy"), &[]);

    let reply = rig
        .client
        .proxy()
        .attr("this")
        .attr("has")
        .attr("a")
        .attr("toy")
        .attr("value")
        .invoke(vec![])
        .await
        .unwrap();
    assert_eq!(reply, json!(12));

    let reply = rig
        .client
        .proc("this.has.a.toy.value")
        .invoke(vec![])
        .await
        .unwrap();
    assert_eq!(reply, json!(12));

    rig.shutdown().await;
}

#[tokio::test]
async fn timeout_expires_and_the_client_stays_usable() {
    let rig = start_pair().await;
    register_sleep(&rig.service);
    register_echo(&rig.service);

    let started = Instant::now();
    let err = rig
        .client
        .call(
            "sleep",
            vec![json!(2.3)],
            Kwargs::new(),
            CallOptions::timeout(Duration::from_millis(1100)),
        )
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, RpcError::Timeout(_)), "got {err:?}");
    assert!(elapsed >= Duration::from_millis(1100));
    assert!(elapsed < Duration::from_millis(2300), "timer did not fire early enough");

    // the expired request must not poison later calls; its eventual reply
    // is dropped as an orphan
    let reply = rig.client.invoke("echo", vec![json!("still alive")]).await.unwrap();
    assert_eq!(reply, json!("still alive"));

    rig.shutdown().await;
}

#[tokio::test]
async fn ignore_returns_immediately_with_null() {
    let rig = start_pair().await;
    register_sleep(&rig.service);
    register_echo(&rig.service);

    let started = Instant::now();
    let reply = rig
        .client
        .call(
            "sleep",
            vec![json!(1.5)],
            Kwargs::new(),
            CallOptions::ignore(),
        )
        .await
        .unwrap()
        .into_value()
        .unwrap();
    assert_eq!(reply, Value::Null);
    assert!(started.elapsed() < Duration::from_millis(500));

    // the client keeps working while the ignored call still runs remotely
    let reply = rig.client.invoke("echo", vec![json!(1)]).await.unwrap();
    assert_eq!(reply, json!(1));

    rig.shutdown().await;
}

#[tokio::test]
async fn call_before_connect_is_a_configuration_error() {
    common::init_logging();
    let context = zrpc_core::zmq::Context::new();
    let client = zrpc_core::Client::new(context, zrpc_core::ClientConfig::default());

    let err = client.invoke("echo", vec![]).await.unwrap_err();
    match err {
        RpcError::Config(msg) => assert_eq!(msg, "bind or connect must be called first"),
        other => panic!("expected a configuration error, got {other:?}"),
    }

    client.shutdown();
}

#[tokio::test]
async fn shutdown_wakes_pending_callers() {
    let rig = start_pair().await;
    register_sleep(&rig.service);

    let client = Arc::new(rig.client);
    let caller = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.invoke("sleep", vec![json!(30)]).await })
    };

    tokio::time::sleep(Duration::from_millis(300)).await;
    client.shutdown();

    let result = caller.await.unwrap();
    assert!(
        matches!(result, Err(RpcError::Transport(_))),
        "got {result:?}"
    );

    rig.service.shutdown().await;
}

#[tokio::test]
async fn division_by_keyword_mixes_args_and_kwargs() {
    let rig = start_pair().await;
    rig.service
        .register_fn("scale", |args, kwargs| {
            let base = arg_f64(&args, 0)?;
            let factor = kwargs.get("factor").and_then(Value::as_f64).unwrap_or(1.0);
            Ok(json!(base * factor))
        })
        .unwrap();

    let reply = rig
        .client
        .call(
            "scale",
            vec![json!(7)],
            kwargs_of(&[("factor", json!(3))]),
            CallOptions::default(),
        )
        .await
        .unwrap()
        .into_value()
        .unwrap();
    assert_eq!(reply, json!(21.0));

    rig.shutdown().await;
}
