//! The four registry operations as a dynamically typed call surface.
//!
//! The binding only checks argument shape and translates between
//! [`Value`]s and registry types. Zone resolution, validation and locking
//! all happen in `upzone-core`.

use crate::value::Value;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use upzone_core::domain::{Resolver, SystemResolver};
use upzone_core::{ErrorKind, PeerAddress, PeerSettings, PeerView, RegistryError, ZoneDirectory};

/// An operation exposed by the binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Display names of every shared zone.
    ListZones,
    /// Peers of one zone.
    DescribeZone,
    /// Append a peer to a zone.
    AddPeer,
    /// Set a peer's administrative down flag.
    SetPeerDown,
}

impl Operation {
    /// Every operation, in table order.
    pub const ALL: [Operation; 4] = [
        Operation::ListZones,
        Operation::DescribeZone,
        Operation::AddPeer,
        Operation::SetPeerDown,
    ];

    /// Name under which the operation is exported.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::ListZones => "list_zones",
            Operation::DescribeZone => "describe_zone",
            Operation::AddPeer => "add_peer",
            Operation::SetPeerDown => "set_peer_down",
        }
    }

    /// Exact number of arguments the operation takes.
    pub fn arity(&self) -> usize {
        match self {
            Operation::ListZones => 0,
            Operation::DescribeZone => 1,
            Operation::AddPeer => 6,
            Operation::SetPeerDown => 3,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// No operation carries the requested name.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown operation {0:?}")]
pub struct UnknownOperation(pub String);

impl FromStr for Operation {
    type Err = UnknownOperation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operation::ALL
            .into_iter()
            .find(|op| op.name() == s)
            .ok_or_else(|| UnknownOperation(s.to_owned()))
    }
}

/// Coarse classification of a [`QueryError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryErrorKind {
    /// Wrong number or type of arguments.
    ArgumentShape,
    /// The call was made without a zone directory.
    NoContext,
    /// The registry refused the operation.
    Registry(ErrorKind),
}

/// Why a binding call failed. The display text is the caller-facing message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// Wrong number of arguments.
    #[error("{}", arity_message(.expected))]
    ArgumentCount {
        /// Number of arguments the operation takes.
        expected: usize,
    },

    /// An argument has the wrong type or an unusable value.
    #[error("bad argument #{position} ({reason})")]
    BadArgument {
        /// One-based argument position.
        position: usize,
        /// What was expected.
        reason: String,
    },

    /// No zone directory was supplied.
    #[error("no active request context")]
    NoContext,

    /// Zone resolution or the registry operation failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

fn arity_message(expected: &usize) -> String {
    match *expected {
        0 => "no argument expected".to_owned(),
        1 => "exactly 1 argument expected".to_owned(),
        n => format!("exactly {n} arguments expected"),
    }
}

impl QueryError {
    /// Classify the error.
    pub fn kind(&self) -> QueryErrorKind {
        match self {
            QueryError::ArgumentCount { .. } | QueryError::BadArgument { .. } => {
                QueryErrorKind::ArgumentShape
            }
            QueryError::NoContext => QueryErrorKind::NoContext,
            QueryError::Registry(err) => QueryErrorKind::Registry(err.kind()),
        }
    }
}

/// Two-part reply: a result, or `Nil` plus a message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply {
    /// The result, `Nil` on failure.
    pub result: Value,
    /// The failure message.
    pub error: Option<String>,
}

impl From<Result<Value, QueryError>> for Reply {
    fn from(outcome: Result<Value, QueryError>) -> Self {
        match outcome {
            Ok(result) => Reply {
                result,
                error: None,
            },
            Err(err) => Reply {
                result: Value::Nil,
                error: Some(err.to_string()),
            },
        }
    }
}

/// Dispatches binding calls onto a zone directory.
#[derive(Debug, Clone, Default)]
pub struct QueryBinding<R = SystemResolver> {
    resolver: R,
}

impl QueryBinding {
    /// Binding resolving peer host names through the system resolver.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<R: Resolver> QueryBinding<R> {
    /// Binding resolving peer host names through `resolver`.
    pub fn with_resolver(resolver: R) -> Self {
        Self { resolver }
    }

    /// Run `op` with `args` against the directory in `ctx`.
    ///
    /// `ctx` is `None` when the caller has no request context; only
    /// `list_zones` reports that as such, the zone-addressed operations
    /// find no zone.
    pub fn call(
        &self,
        ctx: Option<&ZoneDirectory>,
        op: Operation,
        args: &[Value],
    ) -> Result<Value, QueryError> {
        if args.len() != op.arity() {
            return Err(QueryError::ArgumentCount {
                expected: op.arity(),
            });
        }

        debug!(operation = %op, "binding call");
        match op {
            Operation::ListZones => list_zones(ctx),
            Operation::DescribeZone => describe_zone(ctx, args),
            Operation::AddPeer => self.add_peer(ctx, args),
            Operation::SetPeerDown => set_peer_down(ctx, args),
        }
    }

    /// [`QueryBinding::call`], flattened into a [`Reply`].
    pub fn reply(&self, ctx: Option<&ZoneDirectory>, op: Operation, args: &[Value]) -> Reply {
        self.call(ctx, op, args).into()
    }

    fn add_peer(&self, ctx: Option<&ZoneDirectory>, args: &[Value]) -> Result<Value, QueryError> {
        let zone = string_arg(args, 1)?;
        let address = string_arg(args, 2)?;
        let weight = int_arg(args, 3)?;
        let max_fails = int_arg(args, 4)?;
        let fail_timeout = int_arg(args, 5)?;
        let down = args[5].truthy();

        let weight = u32::try_from(weight)
            .ok()
            .and_then(NonZeroU32::new)
            .ok_or_else(|| bad_argument(3, "weight must be a positive integer"))?;
        let max_fails = u32::try_from(max_fails)
            .map_err(|_| bad_argument(4, "max_fails must be a non-negative integer"))?;
        let fail_timeout = u64::try_from(fail_timeout)
            .map_err(|_| bad_argument(5, "fail_timeout must be a non-negative integer"))?;

        let directory = ctx.ok_or(RegistryError::ZoneNotFound)?;
        let registry = directory.resolve(&zone)?.registry()?;

        let address = PeerAddress::parse(&address, &self.resolver)?;
        let settings = PeerSettings {
            weight,
            max_fails,
            fail_timeout: Duration::from_secs(fail_timeout),
            down,
        };
        registry.add(&address, &settings)?;

        Ok(Value::Bool(true))
    }
}

fn list_zones(ctx: Option<&ZoneDirectory>) -> Result<Value, QueryError> {
    let directory = ctx.ok_or(QueryError::NoContext)?;
    Ok(Value::List(
        directory
            .display_names()
            .into_iter()
            .map(Value::Str)
            .collect(),
    ))
}

fn describe_zone(ctx: Option<&ZoneDirectory>, args: &[Value]) -> Result<Value, QueryError> {
    let zone = string_arg(args, 1)?;

    let directory = ctx.ok_or(RegistryError::ZoneNotFound)?;
    let registry = directory.resolve(&zone)?.registry()?;

    Ok(Value::List(registry.list().iter().map(peer_record).collect()))
}

fn set_peer_down(ctx: Option<&ZoneDirectory>, args: &[Value]) -> Result<Value, QueryError> {
    let zone = string_arg(args, 1)?;
    let server = string_arg(args, 2)?;
    let down = args[2].truthy();

    let directory = ctx.ok_or(RegistryError::ZoneNotFound)?;
    let registry = directory.resolve(&zone)?.registry()?;
    registry.set_down(&server, down)?;

    Ok(Value::Bool(true))
}

/// The descriptive record of one peer.
///
/// `accessed` and `checked` appear only when set, `down` only when true.
pub fn peer_record(peer: &PeerView) -> Value {
    let mut record = BTreeMap::new();
    record.insert("name".to_owned(), Value::from(peer.name.as_str()));
    record.insert("weight".to_owned(), Value::from(peer.weight));
    record.insert("current_weight".to_owned(), Value::Int(peer.current_weight));
    record.insert("effective_weight".to_owned(), Value::Int(peer.effective_weight));
    record.insert("fails".to_owned(), Value::from(peer.fails));
    record.insert("max_fails".to_owned(), Value::from(peer.max_fails));
    record.insert(
        "fail_timeout".to_owned(),
        Value::Int(i64::try_from(peer.fail_timeout).unwrap_or(i64::MAX)),
    );

    if let Some(accessed) = peer.accessed {
        record.insert("accessed".to_owned(), Value::Int(accessed));
    }
    if let Some(checked) = peer.checked {
        record.insert("checked".to_owned(), Value::Int(checked));
    }
    if peer.down {
        record.insert("down".to_owned(), Value::Bool(true));
    }

    Value::Table(record)
}

fn bad_argument(position: usize, reason: impl Into<String>) -> QueryError {
    QueryError::BadArgument {
        position,
        reason: reason.into(),
    }
}

fn string_arg(args: &[Value], position: usize) -> Result<String, QueryError> {
    let value = &args[position - 1];
    value
        .as_str()
        .map(|s| s.into_owned())
        .ok_or_else(|| bad_argument(position, format!("string expected, got {}", value.type_name())))
}

fn int_arg(args: &[Value], position: usize) -> Result<i64, QueryError> {
    let value = &args[position - 1];
    value
        .as_int()
        .ok_or_else(|| bad_argument(position, format!("number expected, got {}", value.type_name())))
}
