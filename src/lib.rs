// modbus-ports - transport ports beneath a Modbus master
//
// A port moves raw RTU frames over one medium:
// - UDP bridge: RTU tunnelled through a UDP-to-serial gateway envelope
// - BLE: RTU carried over a write/notify GATT characteristic pair

pub mod frame;
pub mod port;

pub use frame::{crc16, RequestDescriptor};
pub use port::{Port, PortError, PortEvent, PortState};
