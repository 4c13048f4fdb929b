//! Connector fixtures shared by tests across the workspace.

use crate::{
    Capabilities,
    ConnectionSettings,
    ConnectorConfig,
    ConnectorId,
    RemoteFunction,
    RemoteFunctionKind,
};

pub const TEST_REGION: &str = "test-region-1";

pub fn http_connector(id: &str, url: &str) -> ConnectorConfig {
    ConnectorConfig {
        id: ConnectorId::from(id),
        active: true,
        skip_auto_disable: false,
        remote_function: RemoteFunction {
            kind: RemoteFunctionKind::Http {
                url: url.to_string(),
            },
            warm_up: 0,
            protocol_version: "0.6".to_string(),
        },
        capabilities: Capabilities::default(),
        connection_settings: ConnectionSettings::default(),
    }
}

pub fn embedded_connector(id: &str, handler: &str) -> ConnectorConfig {
    ConnectorConfig {
        id: ConnectorId::from(id),
        active: true,
        skip_auto_disable: false,
        remote_function: RemoteFunction {
            kind: RemoteFunctionKind::Embedded {
                handler: handler.to_string(),
            },
            warm_up: 0,
            protocol_version: "0.6".to_string(),
        },
        capabilities: Capabilities::default(),
        connection_settings: ConnectionSettings::default(),
    }
}

pub fn cloud_connector(id: &str, function_arn: &str) -> ConnectorConfig {
    ConnectorConfig {
        id: ConnectorId::from(id),
        active: true,
        skip_auto_disable: false,
        remote_function: RemoteFunction {
            kind: RemoteFunctionKind::CloudFunction {
                function_arn: function_arn.to_string(),
                region: TEST_REGION.to_string(),
                role: None,
            },
            warm_up: 0,
            protocol_version: "0.6".to_string(),
        },
        capabilities: Capabilities::default(),
        connection_settings: ConnectionSettings::default(),
    }
}
