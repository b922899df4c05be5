use axum::{Json, extract::State};
use serde::Serialize;
use std::sync::Arc;

use crate::state::AppState;

#[derive(Serialize)]
pub struct MethodInfo {
    pub name: &'static str,
    pub route: &'static str,
    pub request: &'static str,
    pub response: &'static str,
    pub client_streaming: bool,
    pub server_streaming: bool,
}

#[derive(Serialize)]
pub struct ServiceInfo {
    pub name: &'static str,
    pub methods: Vec<MethodInfo>,
}

#[derive(Serialize)]
pub struct Reflection {
    pub services: Vec<ServiceInfo>,
    pub models: Vec<String>,
}

// Lists the services this dispatcher exposes
pub async fn reflection_handler(State(state): State<Arc<AppState>>) -> Json<Reflection> {
    let dispatcher = ServiceInfo {
        name: "Dispatcher",
        methods: vec![
            MethodInfo {
                name: "Generate",
                route: "POST /v1/generate",
                request: "DispatcherRequest",
                response: "DispatcherResponse",
                client_streaming: false,
                server_streaming: false,
            },
            MethodInfo {
                name: "GenerateStream",
                route: "POST /v1/generate_stream",
                request: "DispatcherRequest",
                response: "DispatcherResponse",
                client_streaming: false,
                server_streaming: true,
            },
            MethodInfo {
                name: "DoWork",
                route: "GET /v1/work",
                request: "DispatcherResponse",
                response: "DispatcherRequest",
                client_streaming: true,
                server_streaming: true,
            },
        ],
    };
    let health = ServiceInfo {
        name: "Health",
        methods: vec![MethodInfo {
            name: "Check",
            route: "GET /health/{ready,live,startup}",
            request: "",
            response: "HealthReport",
            client_streaming: false,
            server_streaming: false,
        }],
    };

    Json(Reflection {
        services: vec![dispatcher, health],
        models: state.registry.models().to_vec(),
    })
}
