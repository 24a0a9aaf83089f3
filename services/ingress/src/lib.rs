pub mod persistence;
pub mod proxy;

pub use proxy::{
    Backend, BackendPool, BackendSelector, Listener, ListenerConfig, ProtocolHint, ProxyProtocol,
    ProxyProtocolV2, Route, RouteTable, RoutingDecision, SharedRouteTable, SniConfig, SniInspector,
    SniResult,
};
