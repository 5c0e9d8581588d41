use service_async::Param;

use super::{H2Config, ServerConfig};
use crate::codec::GrpcCodec;

impl Param<H2Config> for ServerConfig {
    fn param(&self) -> H2Config {
        self.h2
    }
}

impl Param<GrpcCodec> for ServerConfig {
    fn param(&self) -> GrpcCodec {
        GrpcCodec::new(self.max_message_size)
    }
}
