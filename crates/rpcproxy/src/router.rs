use std::collections::HashSet;

use tonic::Status;
use tonic::codegen::http;
use tonic::service::Routes;
use tracing::info;

use crate::error::ProxyError;
use crate::handler::ProxyService;
use crate::path::MethodPath;

/// Mounts a [`ProxyService`] on a tonic server.
///
/// Two modes, which can be combined:
/// - explicit: [`register_service`](Self::register_service) wires a fixed
///   set of methods of one service to the proxy, as generated code would for
///   a native implementation.
/// - transparent: [`transparent`](Self::transparent) sends every call that
///   no other route handles through the proxy.
///
/// # Example
///
/// ```ignore
/// let routes = ProxyRouter::new(proxy)
///     .register_service("vgough.testproto.TestService", ["PingEmpty", "Ping", "PingList"])?
///     .into_routes();
///
/// tonic::transport::Server::builder()
///     .add_routes(routes)
///     .serve(addr)
///     .await?;
/// ```
#[derive(Debug)]
pub struct ProxyRouter {
    proxy: ProxyService,
    router: axum::Router,
    registered: HashSet<String>,
    transparent: bool,
}

impl ProxyRouter {
    pub fn new(proxy: ProxyService) -> Self {
        Self {
            proxy,
            router: axum::Router::new(),
            registered: HashSet::new(),
            transparent: false,
        }
    }

    /// Start from existing tonic routes.
    ///
    /// Natively implemented services keep handling their own methods; the
    /// proxy only sees what is registered here or, in transparent mode, what
    /// nothing else matched.
    pub fn with_routes(proxy: ProxyService, routes: Routes) -> Self {
        Self {
            router: routes.into_axum_router(),
            ..Self::new(proxy)
        }
    }

    /// Proxy the given methods of `service_name`.
    ///
    /// `service_name` is fully qualified (`package.Service`), method names
    /// are bare (`Ping`).
    pub fn register_service<I, M>(mut self, service_name: &str, methods: I) -> Result<Self, ProxyError>
    where
        I: IntoIterator<Item = M>,
        M: AsRef<str>,
    {
        for method in methods {
            let path = MethodPath::new(service_name, method.as_ref())?.full_path();
            if !self.registered.insert(path.clone()) {
                return Err(ProxyError::DuplicateRoute(path));
            }

            self.router = self.router.route_service(&path, self.proxy.clone());
            info!(method = %path, "Registered proxy route");
        }

        Ok(self)
    }

    /// Proxy every call that no other route handles.
    pub fn transparent(mut self) -> Self {
        if !self.transparent {
            self.router = self.router.fallback_service(self.proxy.clone());
            self.transparent = true;
            info!("Proxying all unhandled methods");
        }
        self
    }

    /// Check if a method is explicitly routed through the proxy.
    pub fn has_route(&self, path: &str) -> bool {
        MethodPath::parse(path)
            .map(|method| self.registered.contains(&method.full_path()))
            .unwrap_or(false)
    }

    pub fn is_transparent(&self) -> bool {
        self.transparent
    }

    pub fn proxy(&self) -> &ProxyService {
        &self.proxy
    }

    /// Finish into routes for `tonic::transport::Server::add_routes`.
    ///
    /// Outside transparent mode, methods nothing handles are answered with
    /// `Unimplemented` like on any tonic server.
    pub fn into_routes(self) -> Routes {
        let router = if self.transparent {
            self.router
        } else {
            self.router.fallback(unknown_method)
        };
        Routes::from(router)
    }
}

async fn unknown_method() -> http::Response<axum::body::Body> {
    Status::unimplemented("Unknown method").into_http()
}
