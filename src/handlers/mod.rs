//! HTTP handlers, one module per resource.
//!
//! Handlers resolve the caller through the `AuthUser`/`AdminUser` extractors, enforce
//! the page guard with `AuthUser::require`, and delegate persistence to the
//! `Repository` held in `AppState`. Every handler returns `Result<_, ApiError>`.

use std::{
    convert::Infallible,
    net::{IpAddr, SocketAddr},
};

use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::request::Parts,
};

pub mod auth;
pub mod dashboard;
pub mod deliveries;
pub mod operations;
pub mod rbac;
pub mod users;
pub mod vehicle_types;
pub mod vehicles;

/// Client address used as the login rate-limit key.
///
/// The first `x-forwarded-for` hop wins, then the socket peer. Requests without
/// either (only possible in tests) share the unspecified address.
pub(crate) fn client_ip(parts: &Parts) -> IpAddr {
    let forwarded = parts
        .headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|first| first.trim().parse::<IpAddr>().ok());

    forwarded
        .or_else(|| {
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip())
        })
        .unwrap_or(IpAddr::from([0, 0, 0, 0]))
}

/// ClientIp
///
/// Extractor wrapping `client_ip`. Never rejects.
#[derive(Debug, Clone, Copy)]
pub struct ClientIp(pub IpAddr);

impl<S: Send + Sync> FromRequestParts<S> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(client_ip(parts)))
    }
}

#[cfg(test)]
mod tests {
    use axum::http::Request;

    use super::*;

    fn parts(builder: axum::http::request::Builder) -> Parts {
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_forwarded_for_takes_first_hop() {
        let parts = parts(Request::builder().header("x-forwarded-for", "203.0.113.7, 10.0.0.1"));
        assert_eq!(client_ip(&parts), "203.0.113.7".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_falls_back_to_socket_address() {
        let mut parts = parts(Request::builder());
        parts
            .extensions
            .insert(ConnectInfo(SocketAddr::from(([192, 168, 1, 20], 4000))));
        assert_eq!(client_ip(&parts), "192.168.1.20".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_garbage_header_is_ignored() {
        let parts = parts(Request::builder().header("x-forwarded-for", "not-an-ip"));
        assert_eq!(client_ip(&parts), IpAddr::from([0, 0, 0, 0]));
    }
}
