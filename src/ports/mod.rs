pub mod http_client;
pub mod interceptor_factory;
