mod circuit;
mod coordinator;
mod domestic;
mod gateway;

pub use circuit::{BreakerSettings, BreakerState, CircuitBreaker};
pub use coordinator::{CoordinatorSettings, TransferCoordinator};
pub use domestic::{
    DomesticSettings, DomesticTransferTxn, DomesticTransferWorker, DomesticWorkerMessage,
    TransferAction, SERVICE_NAME,
};
pub use gateway::{
    GatewayError, GatewayRequest, GatewayResponse, GatewayTransferStatus, HttpTransferGateway,
    TransferGatewayApi,
};
