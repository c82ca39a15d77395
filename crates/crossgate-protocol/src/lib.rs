mod api;
mod codec;
mod messages;

pub use api::{
    connection_id, dataplane_server_name, remote_endpoint, AUTHORIZATION_HEADER, CONNECT_PATH,
    DATAPLANE_NAME_SUFFIX, INGRESS_AUTH_PATH, TARGET_CLUSTER_HEADER, WILDCARD,
};
pub use codec::{CodecError, FrameCodec};
pub use messages::{ConnectReply, ConnectRequest, ConnectType, DataPlaneMessage};
