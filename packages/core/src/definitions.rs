mod command_class;
pub use command_class::*;

mod endpoint;
pub use endpoint::*;

mod function_type;
pub use function_type::*;

mod listener_class;
pub use listener_class::*;

mod manufacturer_id;
pub use manufacturer_id::*;

mod message_priority;
pub use message_priority::*;

mod message_type;
pub use message_type::*;

mod node_id;
pub use node_id::*;

mod transmit_options;
pub use transmit_options::*;

mod transmit_status;
pub use transmit_status::*;

mod value_source;
pub use value_source::*;
