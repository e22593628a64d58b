//! The output side of the dispatch graph.
//!
//! [`OutputThing`] keeps, per named port, an ordered list of [`Connection`]s.
//! Lists are copy-on-write: connect and disconnect build a new list and swap
//! it in, while dispatch iterates whatever list was current when it started.
//! A consumer may therefore disconnect itself (or others) from inside its own
//! handler without disturbing the delivery in progress.
//!
//! A port is either open or permanently closed. Completion and error close
//! the port after every connection has been notified, and any later dispatch
//! to it fails with [`FlowError::PortAlreadyClosed`].

use crate::error::{classify, FlowError, HandlerResult, Result, StreamError};
use crate::graph::connection::{Connection, PortHandlers};
use crate::graph::downstream::Downstream;
use crate::graph::id::{InputKey, ThingId};
use crate::graph::input::{FnInput, InputThing};
use crate::graph::port::{qualified, PortMapping, DEFAULT_PORT};
use crate::graph::Event;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};

type ConnectionList<T> = Rc<Vec<Connection<T>>>;

struct PortTable<T> {
    open: BTreeMap<String, ConnectionList<T>>,
    closed: Vec<String>,
}

pub(crate) struct OutputCore<T> {
    id: ThingId,
    name: String,
    ports: RefCell<PortTable<T>>,
}

/// Token returned by a connect call. Calling [`Disconnect::disconnect`]
/// removes the connection; the output thing itself is only weakly held.
#[derive(Clone)]
pub struct Disconnect {
    remove: Rc<dyn Fn() -> bool>,
}

impl Disconnect {
    pub(crate) fn new(remove: impl Fn() -> bool + 'static) -> Self {
        Self {
            remove: Rc::new(remove),
        }
    }

    /// Remove the connection. Returns false if it was already gone.
    pub fn disconnect(&self) -> bool {
        (self.remove)()
    }
}

impl fmt::Debug for Disconnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Disconnect")
    }
}

/// A node that emits events on one or more named ports.
///
/// Cloning the handle shares the same node.
pub struct OutputThing<T: Event> {
    core: Rc<OutputCore<T>>,
}

impl<T: Event> Clone for OutputThing<T> {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
        }
    }
}

impl<T: Event> fmt::Debug for OutputThing<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputThing")
            .field("id", &self.core.id)
            .field("name", &self.core.name)
            .finish()
    }
}

impl<T: Event> OutputThing<T> {
    /// Output thing with only the default port
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_ports(name, &[DEFAULT_PORT])
    }

    /// Output thing with the given set of ports
    pub fn with_ports(name: impl Into<String>, ports: &[&str]) -> Self {
        let open = ports
            .iter()
            .map(|p| (p.to_string(), Rc::new(Vec::new())))
            .collect();
        Self {
            core: Rc::new(OutputCore {
                id: ThingId::next(),
                name: name.into(),
                ports: RefCell::new(PortTable {
                    open,
                    closed: Vec::new(),
                }),
            }),
        }
    }

    pub fn id(&self) -> ThingId {
        self.core.id
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Connect `input` from the default output port to its default input port
    pub fn connect<I>(&self, input: Rc<I>) -> Result<Disconnect>
    where
        I: InputThing<T> + ?Sized,
    {
        self.connect_port(input, PortMapping::default())
    }

    /// Connect `input` according to `mapping`.
    ///
    /// Fails with [`FlowError::InvalidPort`] if the output port is not open
    /// or the input thing has no handlers for the input port.
    pub fn connect_port<I>(&self, input: Rc<I>, mapping: PortMapping) -> Result<Disconnect>
    where
        I: InputThing<T> + ?Sized,
    {
        {
            let table = self.core.ports.borrow();
            if !table.open.contains_key(&mapping.output) {
                let reason = if table.closed.contains(&mapping.output) {
                    "port is already closed".to_string()
                } else {
                    let valid: Vec<&str> = table.open.keys().map(String::as_str).collect();
                    format!("valid ports are {}", valid.join(", "))
                };
                return Err(FlowError::InvalidPort {
                    thing: self.core.name.clone(),
                    port: mapping.output,
                    reason,
                });
            }
        }

        let input_key = InputKey::of(&input);
        // holds the input's allocation so its address is not reused while
        // the token lives
        let pinned: Weak<I> = Rc::downgrade(&input);
        let input_name = InputThing::<T>::name(&*input);
        let downstream = InputThing::<T>::downstream(&*input);
        let handlers = InputThing::<T>::port_handlers(input, &mapping.input)
            .ok_or_else(|| FlowError::InvalidPort {
                thing: input_name.clone(),
                port: mapping.input.clone(),
                reason: "missing handlers on input thing".to_string(),
            })?;

        tracing::debug!(
            "Connecting {} to {}",
            qualified(&self.core.name, &mapping.output),
            qualified(&input_name, &mapping.input)
        );
        let connection = Connection {
            handlers,
            input_key,
            input_name,
            input_port: mapping.input.clone(),
            downstream,
        };
        self.core.update_port(&mapping.output, |list| {
            list.push(connection);
            true
        });

        let weak: Weak<OutputCore<T>> = Rc::downgrade(&self.core);
        let PortMapping {
            output: out_port,
            input: in_port,
        } = mapping;
        Ok(Disconnect::new(move || match weak.upgrade() {
            Some(core) if pinned.strong_count() > 0 => {
                core.remove_connection(&out_port, input_key, &in_port)
            }
            _ => false,
        }))
    }

    /// Connect a closure to the default port through [`FnInput`]
    pub fn connect_fn<F>(&self, on_next: F) -> Result<Disconnect>
    where
        F: Fn(T) -> HandlerResult + 'static,
    {
        self.connect(Rc::new(FnInput::new(on_next)))
    }

    /// True if any open port has at least one connection
    pub fn has_connections(&self) -> bool {
        self.core.has_connections()
    }

    pub fn is_closed(&self, port: &str) -> bool {
        self.core.ports.borrow().closed.iter().any(|p| p == port)
    }

    /// Number of connections on an open port, `None` if the port is not open
    pub fn connection_count(&self, port: &str) -> Option<usize> {
        self.core.ports.borrow().open.get(port).map(|c| c.len())
    }

    /// Names of the ports that are still open
    pub fn open_ports(&self) -> Vec<String> {
        self.core.ports.borrow().open.keys().cloned().collect()
    }

    pub fn dispatch_next(&self, x: T) -> Result<()> {
        self.dispatch_next_on(DEFAULT_PORT, x)
    }

    /// Deliver `x` to every connection of `port`, in connection order.
    pub fn dispatch_next_on(&self, port: &str, x: T) -> Result<()> {
        let connections = self.core.resolve(port)?;
        for conn in connections.iter() {
            (conn.handlers.on_next)(x.clone())
                .map_err(|e| self.core.dispatch_failure(e, conn, || format!("on_next({:?})", x)))?;
        }
        Ok(())
    }

    pub fn dispatch_completed(&self) -> Result<()> {
        self.dispatch_completed_on(DEFAULT_PORT)
    }

    /// Notify every connection of `port` of completion, then close the port.
    pub fn dispatch_completed_on(&self, port: &str) -> Result<()> {
        let connections = self.core.resolve(port)?;
        let result = connections.iter().try_for_each(|conn| {
            (conn.handlers.on_completed)()
                .map_err(|e| self.core.dispatch_failure(e, conn, || "on_completed".to_string()))
        });
        self.core.close_port(port);
        result
    }

    pub fn dispatch_error(&self, err: StreamError) -> Result<()> {
        self.dispatch_error_on(DEFAULT_PORT, err)
    }

    /// Notify every connection of `port` of an error, then close the port.
    pub fn dispatch_error_on(&self, port: &str, err: StreamError) -> Result<()> {
        let connections = self.core.resolve(port)?;
        let result = connections.iter().try_for_each(|conn| {
            (conn.handlers.on_error)(err.clone())
                .map_err(|e| self.core.dispatch_failure(e, conn, || format!("on_error({})", err)))
        });
        self.core.close_port(port);
        result
    }

    /// Object-safe view of this node for graph walking
    pub fn as_downstream(&self) -> Rc<dyn Downstream> {
        Rc::clone(&self.core) as Rc<dyn Downstream>
    }

    /// Every path through the graph starting here, one line per path.
    pub fn downstream_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        self.core
            .collect_paths(&format!("  {}", self.core.name), &mut paths);
        paths
    }

    /// Log every downstream path and return the lines that were logged.
    pub fn print_downstream(&self) -> Vec<String> {
        let header = format!("***** Dump of all paths from {} *****", self.core.name);
        let mut lines = vec![header];
        lines.extend(self.downstream_paths());
        lines.push("*".repeat(12 + self.core.name.len()));
        for line in &lines {
            tracing::info!("{}", line);
        }
        lines
    }

    /// Wrap every connection reachable from here with a logging decorator.
    ///
    /// Trace lines go to the `thingflow::trace` target. Disconnect tokens
    /// issued before tracing keep working, since connections are matched by
    /// input identity and port rather than by handler.
    pub fn trace_downstream(&self) {
        self.core.install_tracing();
        tracing::info!(
            "***** installed tracing in all paths starting from {}",
            self.core.name
        );
    }

    /// One line per port and connection, for debugging.
    pub fn describe_connections(&self) -> Vec<String> {
        let table = self.core.ports.borrow();
        let mut lines = vec![format!("***** InputThings for {} *****", self.core.name)];
        for (port, connections) in &table.open {
            lines.push(format!("  Port {}", port));
            for conn in connections.iter() {
                lines.push(format!("    [{}] => {}", conn.input_port, conn.input_name));
            }
        }
        for port in &table.closed {
            lines.push(format!("  Port {} (closed)", port));
        }
        lines
    }
}

impl<T: Event> OutputCore<T> {
    fn resolve(&self, port: &str) -> Result<ConnectionList<T>> {
        let table = self.ports.borrow();
        match table.open.get(port) {
            Some(list) => Ok(Rc::clone(list)),
            None if table.closed.iter().any(|p| p == port) => Err(FlowError::PortAlreadyClosed {
                thing: self.name.clone(),
                port: port.to_string(),
            }),
            None => Err(FlowError::UnknownPort {
                thing: self.name.clone(),
                port: port.to_string(),
            }),
        }
    }

    /// Copy the port's list, let `edit` change the copy and swap it in if
    /// `edit` reports a change.
    fn update_port(&self, port: &str, edit: impl FnOnce(&mut Vec<Connection<T>>) -> bool) -> bool {
        let mut table = self.ports.borrow_mut();
        match table.open.get_mut(port) {
            Some(current) => {
                let mut next: Vec<Connection<T>> = current.iter().cloned().collect();
                let changed = edit(&mut next);
                if changed {
                    *current = Rc::new(next);
                }
                changed
            }
            None => false,
        }
    }

    fn remove_connection(&self, output_port: &str, key: InputKey, input_port: &str) -> bool {
        let removed = self.update_port(output_port, |list| {
            match list.iter().position(|c| c.matches(key, input_port)) {
                Some(index) => {
                    list.remove(index);
                    true
                }
                None => false,
            }
        });
        if removed {
            tracing::debug!(
                "Disconnected {} from {}",
                qualified(&self.name, output_port),
                input_port
            );
        }
        removed
    }

    fn close_port(&self, port: &str) {
        let mut table = self.ports.borrow_mut();
        table.open.remove(port);
        if !table.closed.iter().any(|p| p == port) {
            table.closed.push(port.to_string());
        }
    }

    fn dispatch_failure(
        &self,
        err: anyhow::Error,
        conn: &Connection<T>,
        event: impl FnOnce() -> String,
    ) -> FlowError {
        match classify(err) {
            Ok(fatal) => fatal,
            Err(ordinary) => FlowError::Dispatch {
                event: event(),
                origin: self.name.clone(),
                target: qualified(&conn.input_name, &conn.input_port),
                source: ordinary,
            },
        }
    }

    fn traced_connection(&self, port: &str, conn: &Connection<T>) -> Connection<T> {
        let from = qualified(&self.name, port);
        let to = qualified(&conn.input_name, &conn.input_port);
        let PortHandlers {
            on_next,
            on_completed,
            on_error,
        } = conn.handlers.clone();

        let (next_from, next_to) = (from.clone(), to.clone());
        let (done_from, done_to) = (from.clone(), to.clone());
        conn.with_handlers(PortHandlers::new(
            move |x: T| {
                tracing::info!(target: "thingflow::trace", "  {} => ({:?}) => {}", next_from, x, next_to);
                on_next(x)
            },
            move || {
                tracing::info!(target: "thingflow::trace", "  {} => on_completed => {}", done_from, done_to);
                on_completed()
            },
            move |e: StreamError| {
                tracing::info!(target: "thingflow::trace", "  {} => on_error({}) => {}", from, e, to);
                on_error(e)
            },
        ))
    }
}

impl<T: Event> Downstream for OutputCore<T> {
    fn thing_name(&self) -> String {
        self.name.clone()
    }

    fn has_connections(&self) -> bool {
        self.ports.borrow().open.values().any(|c| !c.is_empty())
    }

    fn collect_paths(&self, prefix: &str, paths: &mut Vec<String>) {
        if !self.has_connections() {
            paths.push(prefix.to_string());
            return;
        }
        let snapshot: Vec<(String, ConnectionList<T>)> = self
            .ports
            .borrow()
            .open
            .iter()
            .map(|(port, list)| (port.clone(), Rc::clone(list)))
            .collect();
        for (port, connections) in snapshot {
            for conn in connections.iter() {
                let step = if port == DEFAULT_PORT && conn.input_port == DEFAULT_PORT {
                    format!(" => {}", conn.input_name)
                } else {
                    format!(" [{}]=>[{}] {}", port, conn.input_port, conn.input_name)
                };
                let path = format!("{}{}", prefix, step);
                match &conn.downstream {
                    Some(next) => next.collect_paths(&path, paths),
                    None => paths.push(path),
                }
            }
        }
    }

    fn install_tracing(&self) {
        let snapshot: Vec<(String, ConnectionList<T>)> = self
            .ports
            .borrow()
            .open
            .iter()
            .map(|(port, list)| (port.clone(), Rc::clone(list)))
            .collect();
        for (port, connections) in snapshot {
            for conn in connections.iter() {
                if let Some(next) = &conn.downstream {
                    next.install_tracing();
                }
            }
            let traced: Vec<Connection<T>> = connections
                .iter()
                .map(|conn| self.traced_connection(&port, conn))
                .collect();
            if let Some(slot) = self.ports.borrow_mut().open.get_mut(&port) {
                *slot = Rc::new(traced);
            }
        }
    }
}
