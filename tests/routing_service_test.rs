// End-to-end routing service tests over the RPC surface: round-robin
// distribution, unavailable targets, batch correspondence, and status.

use im_gateway::gateway::RoutingClient;
use im_gateway::routing::{
    ErrorCode, RouteRequest, RoutingService, ServiceInstance,
};
use im_gateway::RoutingConfig;
use std::collections::HashMap;
use std::sync::Arc;

fn test_service_config() -> RoutingConfig {
    RoutingConfig {
        rpc_port: 0,
        ..RoutingConfig::default()
    }
}

async fn started_service(config: RoutingConfig) -> Arc<RoutingService> {
    let service = RoutingService::new(config).unwrap();
    service.start().await.unwrap();
    service
}

fn client_for(service: &RoutingService) -> RoutingClient {
    RoutingClient::new(service.rpc_addr().unwrap().to_string())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_round_robin_across_rpc() {
    let service = started_service(test_service_config()).await;
    for i in 1..=3 {
        service.router().register_service(ServiceInstance::new(
            format!("service_chat_{}", i),
            "chat",
            "localhost",
            50050 + i,
        ));
    }

    let client = client_for(&service);
    for i in 0..6 {
        let response = client
            .route_message(&RouteRequest::new(format!("m{}", i), "chat"))
            .await
            .unwrap();
        assert!(response.accepted, "request {} rejected: {:?}", i, response);
        assert_eq!(response.error_code, ErrorCode::Success);
        assert_eq!(response.message_id, format!("m{}", i));
    }

    // Each instance selected exactly twice.
    let loads: HashMap<String, i64> = service
        .router()
        .instances("chat")
        .iter()
        .map(|i| (i.service_id.clone(), i.load()))
        .collect();
    assert_eq!(loads.len(), 3);
    assert!(
        loads.values().all(|&load| load == 2),
        "uneven distribution: {:?}",
        loads
    );

    service.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_all_unhealthy_is_service_unavailable() {
    let service = started_service(test_service_config()).await;
    service.router().register_service(ServiceInstance::new(
        "service_chat_1",
        "chat",
        "localhost",
        50051,
    ));
    service.router().register_service(ServiceInstance::new(
        "service_chat_2",
        "chat",
        "localhost",
        50052,
    ));
    for instance in service.router().instances("chat") {
        instance.set_healthy(false);
    }

    let client = client_for(&service);
    let response = client
        .route_message(&RouteRequest::new("m42", "chat"))
        .await
        .unwrap();
    assert!(!response.accepted);
    assert_eq!(response.error_code, ErrorCode::ServiceUnavailable);
    assert_eq!(response.message_id, "m42");

    service.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_target_is_invalid_request() {
    let service = started_service(test_service_config()).await;
    let client = client_for(&service);

    let response = client
        .route_message(&RouteRequest::new("m1", ""))
        .await
        .unwrap();
    assert!(!response.accepted);
    assert_eq!(response.error_code, ErrorCode::InvalidRequest);

    service.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_batch_preserves_correspondence() {
    let service = started_service(test_service_config()).await;
    service.router().register_service(ServiceInstance::new(
        "service_chat_1",
        "chat",
        "localhost",
        50051,
    ));

    let client = client_for(&service);
    let requests: Vec<RouteRequest> = (0..5)
        .map(|i| {
            let target = if i == 2 { "missing" } else { "chat" };
            RouteRequest::new(format!("batch-{}", i), target)
        })
        .collect();
    let responses = client.batch_route(&requests).await.unwrap();

    assert_eq!(responses.len(), 5);
    for (i, response) in responses.iter().enumerate() {
        assert_eq!(response.message_id, format!("batch-{}", i));
        if i == 2 {
            assert_eq!(response.error_code, ErrorCode::ServiceUnavailable);
        } else {
            assert!(response.accepted);
        }
    }

    service.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_check_status_reports_health() {
    let service = started_service(test_service_config()).await;
    let client = client_for(&service);

    let status = client.check_status().await.unwrap();
    assert!(status.is_healthy);
    assert_eq!(status.queue_size, 0);

    service.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unregister_makes_service_unavailable() {
    let service = started_service(test_service_config()).await;
    service.router().register_service(ServiceInstance::new(
        "service_chat_1",
        "chat",
        "localhost",
        50051,
    ));

    let client = client_for(&service);
    let response = client
        .route_message(&RouteRequest::new("before", "chat"))
        .await
        .unwrap();
    assert!(response.accepted);

    service.router().unregister_service("service_chat_1");
    let response = client
        .route_message(&RouteRequest::new("after", "chat"))
        .await
        .unwrap();
    assert!(!response.accepted);
    assert_eq!(response.error_code, ErrorCode::ServiceUnavailable);

    service.stop();
}
