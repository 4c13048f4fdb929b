//! Remote function invocation for geodata connectors: per-connector
//! admission control and queueing, pluggable wire transports, payload
//! relocation, response decoding and one failure taxonomy.

pub mod budgets;
pub mod call;
pub mod client;
pub mod error;
pub mod function_client;
pub mod queue;
pub mod registry;
pub mod transport;

pub use crate::{
    budgets::SharedBudgets,
    call::{CallResult, FunctionCall, RpcContext},
    client::RpcClient,
    error::RpcError,
    function_client::{RemoteFunctionClient, ResponseLimits},
    registry::{ClientRegistry, GlobalRpcStats, RpcSettings},
    transport::{
        CloudClientPool, CloudFunctionClient, EmbeddedFunctionClient, EmbeddedHandler,
        EmbeddedHandlerRegistry, FunctionTransport, HttpFunctionClient,
    },
};
