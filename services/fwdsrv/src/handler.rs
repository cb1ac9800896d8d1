//! Request dispatch: inbound PDU to response PDU
//!
//! Every outcome is a well-formed PDU; failures become one of the four
//! exception responses.

use std::sync::Arc;

use modbus_core::{FunctionCode, ModbusError, ModbusPdu, Request};
use tracing::{debug, info, warn};

use crate::error::RequestError;
use crate::routing::RoutingTable;

#[derive(Debug, Clone)]
pub struct RequestHandler {
    routing: Arc<RoutingTable>,
}

impl RequestHandler {
    pub fn new(routing: Arc<RoutingTable>) -> Self {
        Self { routing }
    }

    /// Forward `pdu` to `unit_id` and build the response PDU for the client
    pub async fn handle(&self, unit_id: u8, pdu: &ModbusPdu) -> ModbusPdu {
        let function = pdu.function_code().unwrap_or(0);

        match self.forward(unit_id, pdu).await {
            Ok(response) => response,
            Err(e) => {
                let code = e.exception_code();
                warn!(
                    "Slave {} FC{:02X} failed: {} -> exception {}",
                    unit_id, function, e, code
                );
                code.response_pdu(function)
            },
        }
    }

    async fn forward(&self, unit_id: u8, pdu: &ModbusPdu) -> Result<ModbusPdu, RequestError> {
        let code = pdu
            .function_code()
            .ok_or_else(|| ModbusError::malformed("empty PDU"))?;
        let function = FunctionCode::try_from(code)?;
        let request = Request::decode(function, pdu.payload())?;
        debug!(
            "Slave {} {} addr={} qty={}",
            unit_id,
            function,
            request.address(),
            request.quantity()
        );

        let response = self.routing.dispatch(unit_id, &request).await?;

        if function.is_write() {
            info!(
                "Slave {} {} addr={} qty={} ok",
                unit_id,
                function.name(),
                request.address(),
                request.quantity()
            );
        }
        Ok(response.encode()?)
    }
}
