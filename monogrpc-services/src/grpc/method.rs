use std::{any::type_name, collections::HashMap, fmt, rc::Rc};

use futures::future::LocalBoxFuture;
use monogrpc_core::{
    codec::GrpcCodec, message::Message, transport::TransportStream, AnyResult,
};
use tracing::warn;

use super::{dispatch::serve_rpc, stream::RpcStream};

/// What an RPC method returns: a future borrowing the stream it runs on.
pub type RpcFuture<'a> = LocalBoxFuture<'a, AnyResult<()>>;

trait ErasedMethod {
    fn serve<'a>(
        &'a self,
        path: &'a str,
        codec: GrpcCodec,
        transport: Box<dyn TransportStream>,
    ) -> LocalBoxFuture<'a, ()>;
}

struct TypedMethod<F, Req, Resp> {
    func: F,
    _types: std::marker::PhantomData<fn(Req) -> Resp>,
}

impl<F, Req, Resp> ErasedMethod for TypedMethod<F, Req, Resp>
where
    F: for<'a> Fn(&'a mut RpcStream<Req, Resp>) -> RpcFuture<'a>,
    Req: Message + 'static,
    Resp: Message + 'static,
{
    fn serve<'a>(
        &'a self,
        path: &'a str,
        codec: GrpcCodec,
        transport: Box<dyn TransportStream>,
    ) -> LocalBoxFuture<'a, ()> {
        Box::pin(serve_rpc(&self.func, path, codec, transport))
    }
}

/// A routable RPC method: its path, its message types and its implementation.
///
/// The request and reply types are bound when the descriptor is built, so the
/// function can only ever receive and send the types it declared.
#[derive(Clone)]
pub struct MethodDescriptor {
    path: String,
    request_type: &'static str,
    reply_type: &'static str,
    func: Rc<dyn ErasedMethod>,
}

impl MethodDescriptor {
    pub fn new<Req, Resp, F>(path: impl Into<String>, func: F) -> Self
    where
        F: for<'a> Fn(&'a mut RpcStream<Req, Resp>) -> RpcFuture<'a> + 'static,
        Req: Message + 'static,
        Resp: Message + 'static,
    {
        Self {
            path: path.into(),
            request_type: type_name::<Req>(),
            reply_type: type_name::<Resp>(),
            func: Rc::new(TypedMethod {
                func,
                _types: std::marker::PhantomData,
            }),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn request_type(&self) -> &'static str {
        self.request_type
    }

    pub fn reply_type(&self) -> &'static str {
        self.reply_type
    }

    pub(crate) fn serve(
        &self,
        codec: GrpcCodec,
        transport: Box<dyn TransportStream>,
    ) -> LocalBoxFuture<'_, ()> {
        self.func.serve(&self.path, codec, transport)
    }
}

impl fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("path", &self.path)
            .field("request_type", &self.request_type)
            .field("reply_type", &self.reply_type)
            .finish()
    }
}

/// Routing table from request path to method.
#[derive(Debug, Clone, Default)]
pub struct Mapping {
    methods: HashMap<String, MethodDescriptor>,
}

impl Mapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges the mappings of every group in order.
    pub fn from_groups(groups: &[&dyn ServiceGroup]) -> Self {
        let mut mapping = Mapping::new();
        for group in groups {
            mapping.merge(group.mapping());
        }
        mapping
    }

    /// Registers a method, returning the one it replaced.
    pub fn insert(&mut self, method: MethodDescriptor) -> Option<MethodDescriptor> {
        self.methods.insert(method.path.clone(), method)
    }

    pub fn with(mut self, method: MethodDescriptor) -> Self {
        self.insert(method);
        self
    }

    pub fn merge(&mut self, other: Mapping) {
        for (_, method) in other.methods {
            if let Some(replaced) = self.insert(method) {
                warn!(path = replaced.path(), "rpc method registered twice, keeping the last one");
            }
        }
    }

    pub fn get(&self, path: &str) -> Option<&MethodDescriptor> {
        self.methods.get(path)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }
}

/// A set of RPC methods registered together, typically one gRPC service.
pub trait ServiceGroup {
    fn mapping(&self) -> Mapping;
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn first<'a>(_: &'a mut RpcStream<Bytes, Bytes>) -> RpcFuture<'a> {
        Box::pin(async { Ok(()) })
    }

    fn second<'a>(_: &'a mut RpcStream<String, Vec<u8>>) -> RpcFuture<'a> {
        Box::pin(async { Ok(()) })
    }

    struct Group(&'static str, bool);

    impl ServiceGroup for Group {
        fn mapping(&self) -> Mapping {
            match self.1 {
                true => Mapping::new().with(MethodDescriptor::new(self.0, first)),
                false => Mapping::new().with(MethodDescriptor::new(self.0, second)),
            }
        }
    }

    #[test]
    fn test_groups_merge_in_order() {
        let a = Group("/pkg.A/Call", true);
        let b = Group("/pkg.B/Call", true);
        let override_a = Group("/pkg.A/Call", false);
        let mapping = Mapping::from_groups(&[&a, &b, &override_a]);

        assert_eq!(mapping.len(), 2);
        let method = mapping.get("/pkg.A/Call").unwrap();
        assert_eq!(method.request_type(), type_name::<String>());
        assert_eq!(method.reply_type(), type_name::<Vec<u8>>());
        assert!(mapping.get("/pkg.C/Call").is_none());
    }
}
