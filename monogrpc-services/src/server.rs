use std::{
    cell::RefCell,
    collections::HashMap,
    convert::Infallible,
    fmt::Debug,
    io,
    net::SocketAddr,
    rc::{Rc, Weak},
};

use futures::future::join_all;
use futures_channel::oneshot::{self, Receiver as OReceiver, Sender as OSender};
use monoio::{io::stream::Stream, task::JoinHandle};
use monogrpc_core::{
    codec::GrpcCodec,
    config::{H2Config, ServerConfig},
    listener::ListenerBuilder,
    transport::StreamHandler,
};
use service_async::{MakeService, Param, Service};
use tracing::{debug, error, info, warn};

use crate::grpc::{H2Connection, Handler, Mapping, ServiceGroup};

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error("server is already started")]
    AlreadyStarted,
    #[error("server is not started")]
    NotStarted,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Handlers of the connections currently being served.
#[derive(Default)]
struct HandlerSet {
    next_id: u64,
    handlers: HashMap<u64, Handler>,
}

impl HandlerSet {
    fn register(set: &Rc<RefCell<HandlerSet>>, handler: Handler) -> HandlerRegistration {
        let mut inner = set.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.handlers.insert(id, handler);
        HandlerRegistration {
            id,
            set: Rc::downgrade(set),
        }
    }

    fn snapshot(set: &RefCell<HandlerSet>) -> Vec<Handler> {
        set.borrow().handlers.values().cloned().collect()
    }
}

/// Removes its handler from the server when dropped.
pub struct HandlerRegistration {
    id: u64,
    set: Weak<RefCell<HandlerSet>>,
}

impl Drop for HandlerRegistration {
    fn drop(&mut self) {
        if let Some(set) = self.set.upgrade() {
            set.borrow_mut().handlers.remove(&self.id);
        }
    }
}

/// Builds one [`H2Connection`] with a fresh [`Handler`] per accepted connection.
pub struct GrpcProtocolFactory {
    mapping: Rc<Mapping>,
    codec: GrpcCodec,
    h2: H2Config,
    handlers: Rc<RefCell<HandlerSet>>,
}

impl MakeService for GrpcProtocolFactory {
    type Service = H2Connection;
    type Error = Infallible;

    fn make_via_ref(&self, _old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        let handler = Handler::new(self.mapping.clone(), self.codec);
        let registration = HandlerSet::register(&self.handlers, handler.clone());
        Ok(H2Connection::new(handler, self.h2).registered(registration))
    }
}

struct Serving {
    // dropping it stops the accept loop
    stop: Option<OReceiver<()>>,
    accept_loop: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

/// A gRPC server: one listening socket and the connections accepted on it.
pub struct Server {
    mapping: Rc<Mapping>,
    codec: GrpcCodec,
    h2: H2Config,
    config: ServerConfig,
    handlers: Rc<RefCell<HandlerSet>>,
    serving: Option<Serving>,
}

impl Server {
    pub fn new(groups: &[&dyn ServiceGroup], config: ServerConfig) -> Self {
        let mapping = Mapping::from_groups(groups);
        debug!(methods = mapping.len(), "rpc mapping built");
        Self {
            mapping: Rc::new(mapping),
            codec: config.param(),
            h2: config.param(),
            config,
            handlers: Default::default(),
            serving: None,
        }
    }

    pub fn mapping(&self) -> &Mapping {
        &self.mapping
    }

    /// Bound TCP address once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.serving.as_ref().and_then(|serving| serving.local_addr)
    }

    /// Number of connections currently served.
    pub fn connections(&self) -> usize {
        self.handlers.borrow().handlers.len()
    }

    pub fn protocol_factory(&self) -> GrpcProtocolFactory {
        GrpcProtocolFactory {
            mapping: self.mapping.clone(),
            codec: self.codec,
            h2: self.h2,
            handlers: self.handlers.clone(),
        }
    }

    /// Starts listening on the configured address.
    pub fn start_from_config(&mut self) -> Result<(), ServerError> {
        if self.serving.is_some() {
            return Err(ServerError::AlreadyStarted);
        }
        let builder = ListenerBuilder::try_from(&self.config.listener)?;
        self.start(builder)
    }

    pub fn start(&mut self, builder: ListenerBuilder) -> Result<(), ServerError> {
        if self.serving.is_some() {
            return Err(ServerError::AlreadyStarted);
        }
        let listener = builder.build()?;
        let local_addr = listener.tcp_addr();
        let (stop, stopped) = oneshot::channel();
        let accept_loop = monoio::spawn(serve(listener, self.protocol_factory(), stop));
        info!(?local_addr, "grpc server started");
        self.serving = Some(Serving {
            stop: Some(stopped),
            accept_loop: Some(accept_loop),
            local_addr,
        });
        Ok(())
    }

    /// Stops accepting connections and closes every connection handler.
    pub fn close(&mut self) -> Result<(), ServerError> {
        let serving = self.serving.as_mut().ok_or(ServerError::NotStarted)?;
        serving.stop.take();
        let handlers = HandlerSet::snapshot(&self.handlers);
        info!(connections = handlers.len(), "grpc server closing");
        for handler in handlers {
            handler.close();
        }
        Ok(())
    }

    /// Waits for the listener to be released and every handler to finish.
    pub async fn wait_closed(&mut self) -> Result<(), ServerError> {
        let serving = self.serving.as_mut().ok_or(ServerError::NotStarted)?;
        if let Some(accept_loop) = serving.accept_loop.take() {
            accept_loop.await;
        }
        let handlers = HandlerSet::snapshot(&self.handlers);
        join_all(handlers.iter().map(|handler| handler.wait_closed())).await;
        info!("grpc server closed");
        Ok(())
    }
}

/// Accepts connections until `stop` is cancelled or the listener ends.
pub async fn serve<S, F, A, E>(mut listener: S, factory: F, mut stop: OSender<()>)
where
    S: Stream<Item = Result<A, E>> + 'static,
    E: Debug,
    F: MakeService,
    F::Service: Service<A> + 'static,
    F::Error: Debug,
    <F::Service as Service<A>>::Error: Debug,
    A: 'static,
{
    let mut cancellation = stop.cancellation();
    loop {
        monoio::select! {
            _ = &mut cancellation => {
                info!("server is notified to stop");
                break;
            }
            accept_opt = listener.next() => {
                let accept = match accept_opt {
                    Some(accept) => accept,
                    None => {
                        info!("listener is closed, serve stopped");
                        return;
                    }
                };
                match accept {
                    Ok(accept) => {
                        let svc = match factory.make() {
                            Ok(svc) => svc,
                            Err(e) => {
                                error!("failed to build connection service: {e:?}");
                                continue;
                            }
                        };
                        monoio::spawn(async move {
                            match svc.call(accept).await {
                                Ok(_) => debug!("connection complete"),
                                Err(e) => error!("connection error: {e:?}"),
                            }
                        });
                    }
                    Err(e) => warn!("accept connection failed: {e:?}"),
                }
            }
        }
    }
}
