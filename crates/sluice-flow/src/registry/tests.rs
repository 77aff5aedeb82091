use std::time::Duration;

use parking_lot::Mutex;
use sluice_api::consumer_signal;
use sluice_core::{ErrorKind, ProducerMetadata};
use sluice_execinfra::{flow_stream_pair, FlowStreamClient, RowBuffer};
use sluice_testing::int_types;

use super::*;
use crate::pending::PendingSet;
use crate::tests::{eventually, flow_ctx, flow_ctx_with};
use crate::RowInboundStreamHandler;

fn stream_info(pending: &Arc<PendingSet>, id: u32) -> (StreamId, InboundStreamInfo, Arc<RowBuffer>) {
    let buffer = RowBuffer::new(int_types(1));
    let handler = Arc::new(RowInboundStreamHandler::new(buffer.clone(), int_types(1)));
    let info = InboundStreamInfo::new(handler, pending.add_pending(format!("inbound stream {id}")));
    (StreamId::from(id), info, buffer)
}

fn streams(pending: &Arc<PendingSet>, ids: &[u32]) -> (HashMap<StreamId, InboundStreamInfo>, Vec<Arc<RowBuffer>>) {
    let mut infos = HashMap::new();
    let mut buffers = Vec::new();
    for id in ids {
        let (stream_id, info, buffer) = stream_info(pending, *id);
        infos.insert(stream_id, info);
        buffers.push(buffer);
    }
    (infos, buffers)
}

async fn next_handshake(client: &mut FlowStreamClient) -> ConsumerHandshake {
    match client.signals.recv().await.unwrap().unwrap().value {
        Some(consumer_signal::Value::Handshake(handshake)) => handshake,
        other => panic!("expected handshake, got {other:?}"),
    }
}

fn registry() -> Arc<FlowRegistry> {
    FlowRegistry::new(NodeId::from(1), &TestingKnobs::default())
}

const LONG: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_connect_after_register() {
    let registry = registry();
    let pending = Arc::new(PendingSet::default());
    let (infos, _) = streams(&pending, &[1]);
    let ctx = flow_ctx();
    registry.register_flow(ctx.clone(), infos, LONG).unwrap();

    let (mut client, server) = flow_stream_pair();
    let connected = registry
        .connect_inbound_stream(ctx.id, 1u32.into(), &server.signals, LONG)
        .await
        .unwrap();
    assert_eq!(connected.flow_ctx.id, ctx.id);
    assert!(next_handshake(&mut client).await.consumer_scheduled);

    assert_eq!(pending.pending_count(), 1);
    connected.cleanup.finish();
    assert_eq!(pending.pending_count(), 0);

    registry.unregister_flow(ctx.id);
    assert_eq!(registry.num_flows(), 0);
}

#[tokio::test]
async fn test_connect_waits_for_registration() {
    let registry = registry();
    let ctx = flow_ctx();
    let (mut client, server) = flow_stream_pair();

    let connecting = {
        let registry = registry.clone();
        let flow_id = ctx.id;
        tokio::spawn(async move {
            let connected = registry
                .connect_inbound_stream(flow_id, 7u32.into(), &server.signals, LONG)
                .await;
            (connected.map(|c| c.cleanup.finish()), server)
        })
    };

    let first = next_handshake(&mut client).await;
    assert!(!first.consumer_scheduled);
    assert!(first.consumer_schedule_deadline.is_some());
    // The waiting connection holds the entry.
    assert_eq!(registry.num_flows(), 1);

    let pending = Arc::new(PendingSet::default());
    let (infos, _) = streams(&pending, &[7]);
    registry.register_flow(ctx.clone(), infos, LONG).unwrap();

    let (connected, _server) = connecting.await.unwrap();
    connected.unwrap();
    assert!(next_handshake(&mut client).await.consumer_scheduled);
    assert_eq!(pending.pending_count(), 0);

    registry.unregister_flow(ctx.id);
    assert_eq!(registry.num_flows(), 0);
}

#[tokio::test]
async fn test_connect_to_missing_flow_times_out() {
    let registry = registry();
    let (_client, server) = flow_stream_pair();
    let flow_id = FlowId::new_v4();
    let err = registry
        .connect_inbound_stream(flow_id, 1u32.into(), &server.signals, Duration::from_millis(20))
        .await
        .err()
        .unwrap();
    assert_eq!(err.current_context(), &Error::FlowNotFound(flow_id));
    assert_eq!(registry.num_flows(), 0);
}

#[tokio::test]
async fn test_unknown_and_duplicate_streams() {
    let registry = registry();
    let pending = Arc::new(PendingSet::default());
    let (infos, _) = streams(&pending, &[1]);
    let ctx = flow_ctx();
    registry.register_flow(ctx.clone(), infos, LONG).unwrap();
    let (_client, server) = flow_stream_pair();

    let err = registry
        .connect_inbound_stream(ctx.id, 2u32.into(), &server.signals, LONG)
        .await
        .err()
        .unwrap();
    assert!(matches!(err.current_context(), Error::StreamNotFound { .. }));

    let first = registry
        .connect_inbound_stream(ctx.id, 1u32.into(), &server.signals, LONG)
        .await
        .unwrap();
    let err = registry
        .connect_inbound_stream(ctx.id, 1u32.into(), &server.signals, LONG)
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err.current_context(),
        Error::StreamAlreadyConnected { .. }
    ));

    // Dropping the cleanup finishes the stream.
    drop(first);
    assert_eq!(pending.pending_count(), 0);
    registry.unregister_flow(ctx.id);
}

#[tokio::test]
async fn test_unconnected_streams_time_out() {
    let registry = registry();
    let pending = Arc::new(PendingSet::default());
    let (infos, buffers) = streams(&pending, &[1, 2]);
    let ctx = flow_ctx();
    registry
        .register_flow(ctx.clone(), infos, Duration::from_millis(100))
        .unwrap();

    let (_client, server) = flow_stream_pair();
    let connected = registry
        .connect_inbound_stream(ctx.id, 1u32.into(), &server.signals, LONG)
        .await
        .unwrap();

    // Stream 2 never connects.
    buffers[1].wait_producer_done().await;
    let (rows, metas) = buffers[1].take_all();
    assert!(rows.is_empty());
    assert_eq!(metas.len(), 1);
    assert_eq!(
        metas[0].error().map(|err| err.kind),
        Some(ErrorKind::NoInboundStreamConnection)
    );
    assert!(!buffers[0].is_producer_done());
    assert_eq!(pending.pending_count(), 1);

    let err = registry
        .connect_inbound_stream(ctx.id, 2u32.into(), &server.signals, LONG)
        .await
        .err()
        .unwrap();
    assert!(matches!(err.current_context(), Error::StreamTooLate { .. }));

    connected.cleanup.finish();
    assert_eq!(pending.pending_count(), 0);
    registry.unregister_flow(ctx.id);
}

#[tokio::test]
async fn test_cancel_pending_streams() {
    let registry = registry();
    let pending = Arc::new(PendingSet::default());
    let (infos, buffers) = streams(&pending, &[1]);
    let ctx = flow_ctx();
    registry.register_flow(ctx.clone(), infos, LONG).unwrap();

    registry.cancel_pending_streams(ctx.id, MetadataError::query_canceled());
    pending.wait_idle().await;
    buffers[0].wait_producer_done().await;
    let (_, metas) = buffers[0].take_all();
    assert!(matches!(
        &metas[..],
        [ProducerMetadata::Error(err)] if err.kind == ErrorKind::QueryCanceled
    ));
    registry.unregister_flow(ctx.id);
}

#[tokio::test]
async fn test_register_rejections() {
    let registry = registry();
    let ctx = flow_ctx();
    registry.register_flow(ctx.clone(), HashMap::new(), LONG).unwrap();

    let pending = Arc::new(PendingSet::default());
    let (infos, _) = streams(&pending, &[1]);
    let err = registry.register_flow(ctx.clone(), infos, LONG).unwrap_err();
    assert_eq!(err.current_context(), &Error::AlreadyRegistered(ctx.id));
    // Rejected streams are finished.
    assert_eq!(pending.pending_count(), 0);
    registry.unregister_flow(ctx.id);

    registry.state.lock().draining = true;
    let (infos, _) = streams(&pending, &[1]);
    let err = registry.register_flow(flow_ctx(), infos, LONG).unwrap_err();
    assert_eq!(err.current_context(), &Error::RegistryDraining);
    assert_eq!(pending.pending_count(), 0);

    registry.undrain();
    registry.register_flow(flow_ctx(), HashMap::new(), LONG).unwrap();
}

fn recording_knobs(expected_connection_time: Duration) -> (TestingKnobs, Arc<Mutex<Vec<Duration>>>) {
    let sleeps = Arc::new(Mutex::new(Vec::new()));
    let recorded = sleeps.clone();
    let knobs = TestingKnobs {
        drain_sleep_hook: Some(Arc::new(move |duration| recorded.lock().push(duration))),
        expected_connection_time: Some(expected_connection_time),
        ..TestingKnobs::default()
    };
    (knobs, sleeps)
}

#[tokio::test]
async fn test_drain_without_flows() {
    let (knobs, sleeps) = recording_knobs(LONG);
    let registry = FlowRegistry::new(NodeId::from(1), &knobs);

    let min_wait = Duration::from_millis(10);
    tokio::time::timeout(Duration::from_secs(2), registry.drain(LONG, min_wait))
        .await
        .unwrap();
    assert!(registry.is_draining());
    // An idle registry skips the connection wait.
    assert_eq!(*sleeps.lock(), vec![min_wait]);

    let err = registry
        .register_flow(flow_ctx(), HashMap::new(), LONG)
        .unwrap_err();
    assert_eq!(err.current_context(), &Error::RegistryDraining);
}

#[tokio::test]
async fn test_drain_waits_for_running_flows() {
    let (knobs, sleeps) = recording_knobs(LONG);
    let registry = FlowRegistry::new(NodeId::from(1), &knobs);
    let ctx = flow_ctx_with(knobs, false);
    registry.register_flow(ctx.clone(), HashMap::new(), LONG).unwrap();

    let draining = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.drain(LONG, Duration::ZERO).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!draining.is_finished());
    assert!(!registry.is_draining());

    registry.unregister_flow(ctx.id);
    tokio::time::timeout(Duration::from_secs(2), draining)
        .await
        .unwrap()
        .unwrap();
    assert!(registry.is_draining());
    assert!(sleeps.lock().is_empty());
}

#[tokio::test]
async fn test_drain_refuses_flows_while_waiting_for_connections() {
    let connection_time = Duration::from_millis(500);
    let (knobs, sleeps) = recording_knobs(connection_time);
    let registry = FlowRegistry::new(NodeId::from(1), &knobs);
    let ctx = flow_ctx_with(knobs, false);
    registry.register_flow(ctx.clone(), HashMap::new(), LONG).unwrap();

    let draining = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.drain(Duration::from_millis(20), Duration::ZERO).await })
    };
    eventually("connection wait to start", || {
        sleeps.lock().contains(&connection_time)
    })
    .await;

    assert!(!draining.is_finished());
    assert!(registry.is_draining());
    let err = registry
        .register_flow(flow_ctx(), HashMap::new(), LONG)
        .unwrap_err();
    assert_eq!(err.current_context(), &Error::RegistryDraining);

    tokio::time::timeout(Duration::from_secs(2), draining)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(registry.num_flows(), 1);
    registry.unregister_flow(ctx.id);
}
