pub mod es;

pub use es::EsClient;
