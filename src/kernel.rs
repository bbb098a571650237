use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::application::{this_application, Application};
use crate::error::Result;
use crate::kernel_buffer::KernelBuffer;
use crate::resources::Expression;
use crate::socket_address::SocketAddress;

/// Kernel ids are unique per originating node: one process-wide counter
/// stamps every kernel on first submission or first transmit. Id `1` is
/// reserved for the network master so that clients can address it without
/// prior discovery.
static NEXT_KERNEL_ID: AtomicU64 = AtomicU64::new(2);

pub const NETWORK_MASTER_ID: u64 = 1;

pub fn next_kernel_id() -> u64 {
    NEXT_KERNEL_ID.fetch_add(1, Ordering::Relaxed)
}

/// Result of a kernel, carried downstream to its principal. `Success` is
/// zero so that a final kernel's result can be handed to the process exit
/// status unchanged.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum ExitCode {
    Success = 0,
    Undefined = 1,
    Error = 2,
    EndpointNotConnected = 3,
    NoPrincipalFound = 4,
    NoUpstreamServers = 5,
}

impl ExitCode {
    pub fn from_u16(raw: u16) -> ExitCode {
        match raw {
            0 => ExitCode::Success,
            1 => ExitCode::Undefined,
            3 => ExitCode::EndpointNotConnected,
            4 => ExitCode::NoPrincipalFound,
            5 => ExitCode::NoUpstreamServers,
            _ => ExitCode::Error,
        }
    }

    pub fn is_undefined(self) -> bool {
        self == ExitCode::Undefined
    }

    pub fn to_exit_status(self) -> i32 {
        self as i32
    }
}

impl Default for ExitCode {
    fn default() -> ExitCode {
        ExitCode::Undefined
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitCode::Success => "success",
            ExitCode::Undefined => "undefined",
            ExitCode::Error => "error",
            ExitCode::EndpointNotConnected => "endpoint-not-connected",
            ExitCode::NoPrincipalFound => "no-principal-found",
            ExitCode::NoUpstreamServers => "no-upstream-servers",
        };
        f.write_str(s)
    }
}

bitflags::bitflags! {
    pub struct KernelFlags: u32 {
        const DELETED = 1 << 0;
        const CARRIES_PARENT = 1 << 1;
        const PARENT_IS_ID = 1 << 2;
        const PRINCIPAL_IS_ID = 1 << 3;
        /// One-shot: the kernel survives its delivery to a principal.
        const DO_NOT_DELETE = 1 << 4;
        const PRIORITY_SERVICE = 1 << 5;
        /// The kernel is suspended in the instance registry awaiting
        /// subordinates. Never serialized with a meaning on the wire.
        const PARKED = 1 << 6;
    }
}

bitflags::bitflags! {
    /// Which optional header fields follow the `fields` byte on the wire.
    pub struct KernelFields: u8 {
        const SOURCE_APPLICATION = 1 << 0;
        const TARGET_APPLICATION = 1 << 1;
        const SOURCE = 1 << 2;
        const DESTINATION = 1 << 3;
        const NODE_FILTER = 1 << 4;
    }
}

/// Which direction the kernel is currently moving.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Upstream = 0,
    Downstream = 1,
    PointToPoint = 2,
    Broadcast = 3,
}

impl Phase {
    pub fn from_u8(raw: u8) -> Phase {
        match raw {
            1 => Phase::Downstream,
            2 => Phase::PointToPoint,
            3 => Phase::Broadcast,
            _ => Phase::Upstream,
        }
    }
}

/// A link to a related kernel. Ids are authoritative; the owned form exists
/// only while a carried parent travels inside its child (in a packet, in the
/// transaction log, or in a retention queue awaiting recovery).
pub enum ChainLink {
    None,
    Id(u64),
    Owned(KernelPtr),
}

impl ChainLink {
    pub fn is_set(&self) -> bool {
        !matches!(self, ChainLink::None)
    }

    pub fn id(&self) -> u64 {
        match self {
            ChainLink::None => 0,
            ChainLink::Id(id) => *id,
            ChainLink::Owned(k) => k.base().id(),
        }
    }

    pub fn take_owned(&mut self) -> Option<KernelPtr> {
        if let ChainLink::Owned(_) = self {
            let id = self.id();
            match std::mem::replace(self, ChainLink::Id(id)) {
                ChainLink::Owned(k) => Some(k),
                _ => unreachable!(),
            }
        } else {
            None
        }
    }

    pub fn owned(&self) -> Option<&KernelPtr> {
        match self {
            ChainLink::Owned(k) => Some(k),
            _ => None,
        }
    }
}

impl From<u64> for ChainLink {
    fn from(id: u64) -> ChainLink {
        if id == 0 {
            ChainLink::None
        } else {
            ChainLink::Id(id)
        }
    }
}

impl fmt::Debug for ChainLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainLink::None => f.write_str("-"),
            ChainLink::Id(id) => write!(f, "#{}", id),
            ChainLink::Owned(k) => write!(f, "#{}(owned)", k.base().id()),
        }
    }
}

/// State shared by every kernel: identity, result, lineage, scheduling
/// instant and the optional header fields selected by `fields`.
pub struct KernelBase {
    id: u64,
    old_id: u64,
    result: ExitCode,
    at: SystemTime,
    flags: KernelFlags,
    fields: KernelFields,
    source: SocketAddress,
    destination: SocketAddress,
    source_application: Option<Application>,
    source_application_id: u64,
    target_application: Option<Application>,
    target_application_id: u64,
    node_filter: Option<Expression>,
    path: String,
    weight: u32,
    parent: ChainLink,
    principal: ChainLink,
}

impl KernelBase {
    pub fn new() -> KernelBase {
        let app = this_application::id();
        KernelBase {
            id: 0,
            old_id: 0,
            result: ExitCode::Undefined,
            at: UNIX_EPOCH,
            flags: KernelFlags::empty(),
            fields: KernelFields::empty(),
            source: SocketAddress::Unspecified,
            destination: SocketAddress::Unspecified,
            source_application: None,
            source_application_id: app,
            target_application: None,
            target_application_id: app,
            node_filter: None,
            path: String::new(),
            weight: 1,
            parent: ChainLink::None,
            principal: ChainLink::None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn has_id(&self) -> bool {
        self.id != 0
    }

    pub fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    /// Assign an id from the process-wide counter if the kernel has none.
    pub fn ensure_id(&mut self) -> u64 {
        if self.id == 0 {
            self.id = next_kernel_id();
        }
        self.id
    }

    pub fn old_id(&self) -> u64 {
        self.old_id
    }

    /// Re-stamp with a fresh id, remembering the previous one for
    /// correlation across hops.
    pub fn restamp(&mut self) {
        self.old_id = self.id;
        self.id = next_kernel_id();
    }

    pub fn result(&self) -> ExitCode {
        self.result
    }

    pub fn set_result(&mut self, rhs: ExitCode) {
        self.result = rhs;
    }

    pub fn at(&self) -> SystemTime {
        self.at
    }

    pub fn set_at(&mut self, rhs: SystemTime) {
        self.at = rhs;
    }

    /// Schedule execution `after` from now.
    pub fn set_after(&mut self, after: std::time::Duration) {
        self.at = SystemTime::now() + after;
    }

    pub fn scheduled(&self) -> bool {
        self.at > UNIX_EPOCH
    }

    pub fn flags(&self) -> KernelFlags {
        self.flags
    }

    pub fn setf(&mut self, f: KernelFlags) {
        self.flags |= f;
    }

    pub fn unsetf(&mut self, f: KernelFlags) {
        self.flags &= !f;
    }

    pub fn isset(&self, f: KernelFlags) -> bool {
        self.flags.contains(f)
    }

    pub fn carries_parent(&self) -> bool {
        self.isset(KernelFlags::CARRIES_PARENT)
    }

    pub fn fields(&self) -> KernelFields {
        self.fields
    }

    pub(crate) fn set_fields(&mut self, f: KernelFields) {
        self.fields = f;
    }

    pub fn source(&self) -> &SocketAddress {
        &self.source
    }

    pub fn destination(&self) -> &SocketAddress {
        &self.destination
    }

    pub fn set_source(&mut self, rhs: SocketAddress) {
        self.source = rhs;
    }

    pub fn set_destination(&mut self, rhs: SocketAddress) {
        self.destination = rhs;
    }

    pub fn source_application_id(&self) -> u64 {
        match &self.source_application {
            Some(a) => a.id(),
            None => self.source_application_id,
        }
    }

    pub fn target_application_id(&self) -> u64 {
        match &self.target_application {
            Some(a) => a.id(),
            None => self.target_application_id,
        }
    }

    pub fn set_source_application_id(&mut self, rhs: u64) {
        self.source_application = None;
        self.fields &= !KernelFields::SOURCE_APPLICATION;
        self.source_application_id = rhs;
    }

    pub fn set_target_application_id(&mut self, rhs: u64) {
        self.target_application = None;
        self.fields &= !KernelFields::TARGET_APPLICATION;
        self.target_application_id = rhs;
    }

    pub fn target_application(&self) -> Option<&Application> {
        self.target_application.as_ref()
    }

    pub fn source_application(&self) -> Option<&Application> {
        self.source_application.as_ref()
    }

    pub fn set_target_application(&mut self, app: Application) {
        self.target_application_id = app.id();
        self.target_application = Some(app);
        self.fields |= KernelFields::TARGET_APPLICATION;
    }

    pub fn set_source_application(&mut self, app: Application) {
        self.source_application_id = app.id();
        self.source_application = Some(app);
        self.fields |= KernelFields::SOURCE_APPLICATION;
    }

    pub fn take_target_application(&mut self) -> Option<Application> {
        self.fields &= !KernelFields::TARGET_APPLICATION;
        self.target_application.take()
    }

    pub fn node_filter(&self) -> Option<&Expression> {
        self.node_filter.as_ref()
    }

    pub fn set_node_filter(&mut self, expr: Expression) {
        self.node_filter = Some(expr);
        self.fields |= KernelFields::NODE_FILTER;
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn set_path<S: Into<String>>(&mut self, rhs: S) {
        self.path = rhs.into();
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn set_weight(&mut self, rhs: u32) {
        self.weight = rhs;
    }

    pub fn parent(&self) -> &ChainLink {
        &self.parent
    }

    pub fn parent_mut(&mut self) -> &mut ChainLink {
        &mut self.parent
    }

    pub fn parent_id(&self) -> u64 {
        self.parent.id()
    }

    pub fn set_parent_id(&mut self, id: u64) {
        self.parent = ChainLink::from(id);
        self.flags |= KernelFlags::PARENT_IS_ID;
    }

    pub fn set_parent_owned(&mut self, k: KernelPtr) {
        self.flags &= !KernelFlags::PARENT_IS_ID;
        self.parent = ChainLink::Owned(k);
    }

    pub fn take_parent_link(&mut self) -> ChainLink {
        std::mem::replace(&mut self.parent, ChainLink::None)
    }

    pub fn set_parent_link(&mut self, link: ChainLink) {
        match &link {
            ChainLink::Owned(_) => self.flags &= !KernelFlags::PARENT_IS_ID,
            _ => self.flags |= KernelFlags::PARENT_IS_ID,
        }
        self.parent = link;
    }

    pub fn swap_source_destination(&mut self) {
        std::mem::swap(&mut self.source, &mut self.destination);
    }

    pub fn principal(&self) -> &ChainLink {
        &self.principal
    }

    pub fn principal_id(&self) -> u64 {
        self.principal.id()
    }

    pub fn set_principal_id(&mut self, id: u64) {
        self.principal = ChainLink::from(id);
        self.flags |= KernelFlags::PRINCIPAL_IS_ID;
    }

    pub fn moves_upstream(&self) -> bool {
        self.result.is_undefined() && !self.principal.is_set() && self.parent.is_set()
    }

    pub fn moves_downstream(&self) -> bool {
        !self.result.is_undefined() && self.principal.is_set() && self.parent.is_set()
    }

    pub fn moves_somewhere(&self) -> bool {
        self.result.is_undefined() && self.principal.is_set() && self.parent.is_set()
    }

    pub fn moves_everywhere(&self) -> bool {
        !self.principal.is_set() && !self.parent.is_set()
    }

    pub fn phase(&self) -> Phase {
        if self.moves_downstream() {
            Phase::Downstream
        } else if self.moves_somewhere() {
            Phase::PointToPoint
        } else if self.moves_everywhere() {
            Phase::Broadcast
        } else {
            Phase::Upstream
        }
    }

    /// Route the result back to the parent. Mirrors the source address into
    /// the destination so a kernel that crossed the network retraces its
    /// path.
    pub fn return_to_parent(&mut self, code: ExitCode) {
        self.principal = ChainLink::from(self.parent.id());
        self.flags |= KernelFlags::PRINCIPAL_IS_ID;
        self.result = code;
        if self.source.is_set() {
            self.destination = self.source.clone();
        }
    }

    /// Make this kernel its own principal: the next completion is delivered
    /// back to `react` of the same kernel.
    pub fn recurse(&mut self) {
        let id = self.ensure_id();
        self.set_principal_id(id);
    }

    pub fn mark_deleted(&mut self) {
        self.flags |= KernelFlags::DELETED;
    }

    pub fn is_deleted(&self) -> bool {
        self.isset(KernelFlags::DELETED)
    }

    /// A short state string for logs: phase initial + `c` when the parent
    /// is carried.
    fn state_chars(&self) -> [char; 2] {
        let phase = match self.phase() {
            Phase::Upstream => 'u',
            Phase::Downstream => 'd',
            Phase::PointToPoint => 'p',
            Phase::Broadcast => 'b',
        };
        [phase, if self.carries_parent() { 'c' } else { '-' }]
    }

    pub(crate) fn write_header(&self, out: &mut KernelBuffer) -> Result<()> {
        let mut f = self.fields;
        if self.source.is_set() {
            f |= KernelFields::SOURCE;
        }
        if self.destination.is_set() {
            f |= KernelFields::DESTINATION;
        }
        out.write_u8(f.bits());
        if f.contains(KernelFields::SOURCE_APPLICATION) {
            self.source_application.as_ref().unwrap().write(out)?;
        } else {
            out.write_u64(self.source_application_id);
        }
        if f.contains(KernelFields::TARGET_APPLICATION) {
            self.target_application.as_ref().unwrap().write(out)?;
        } else {
            out.write_u64(self.target_application_id);
        }
        if f.contains(KernelFields::SOURCE) {
            out.write_socket_address(&self.source);
        }
        if f.contains(KernelFields::DESTINATION) {
            out.write_socket_address(&self.destination);
        }
        Ok(())
    }

    pub(crate) fn read_header(&mut self, input: &mut KernelBuffer) -> Result<()> {
        self.fields = KernelFields::from_bits_truncate(input.read_u8()?);
        if self.fields.contains(KernelFields::SOURCE_APPLICATION) {
            let mut app = Application::empty();
            app.read(input)?;
            self.source_application_id = app.id();
            self.source_application = Some(app);
        } else {
            self.source_application_id = input.read_u64()?;
            self.source_application = None;
        }
        if self.fields.contains(KernelFields::TARGET_APPLICATION) {
            let mut app = Application::empty();
            app.read(input)?;
            self.target_application_id = app.id();
            self.target_application = Some(app);
        } else {
            self.target_application_id = input.read_u64()?;
            self.target_application = None;
        }
        self.source = if self.fields.contains(KernelFields::SOURCE) {
            input.read_socket_address()?
        } else {
            SocketAddress::Unspecified
        };
        self.destination = if self.fields.contains(KernelFields::DESTINATION) {
            input.read_socket_address()?
        } else {
            SocketAddress::Unspecified
        };
        Ok(())
    }

    pub(crate) fn swap_header(&mut self, other: &mut KernelBase) {
        std::mem::swap(&mut self.fields, &mut other.fields);
        std::mem::swap(&mut self.source, &mut other.source);
        std::mem::swap(&mut self.destination, &mut other.destination);
        std::mem::swap(&mut self.source_application, &mut other.source_application);
        std::mem::swap(
            &mut self.source_application_id,
            &mut other.source_application_id,
        );
        std::mem::swap(&mut self.target_application, &mut other.target_application);
        std::mem::swap(
            &mut self.target_application_id,
            &mut other.target_application_id,
        );
    }

    pub fn write(&self, out: &mut KernelBuffer) -> Result<()> {
        out.write_u16(self.result as u16);
        out.write_u64(self.id);
        out.write_u64(self.old_id);
        out.write_time_point(self.at);
        out.write_u32(self.flags.bits() & !KernelFlags::PARKED.bits());
        out.write_u64(self.parent.id());
        out.write_u64(self.principal.id());
        out.write_u8(self.phase() as u8);
        out.write_str(&self.path);
        out.write_u32(self.weight);
        if self.fields.contains(KernelFields::NODE_FILTER) {
            match &self.node_filter {
                Some(expr) => expr.write(out),
                None => Expression::Constant(crate::resources::Value::Boolean(true)).write(out),
            }
        }
        Ok(())
    }

    pub fn read(&mut self, input: &mut KernelBuffer) -> Result<()> {
        self.result = ExitCode::from_u16(input.read_u16()?);
        self.id = input.read_u64()?;
        self.old_id = input.read_u64()?;
        self.at = input.read_time_point()?;
        self.flags = KernelFlags::from_bits_truncate(input.read_u32()?);
        let parent_id = input.read_u64()?;
        let principal_id = input.read_u64()?;
        let _phase = Phase::from_u8(input.read_u8()?);
        self.path = input.read_str()?;
        self.weight = input.read_u32()?;
        if self.fields.contains(KernelFields::NODE_FILTER) {
            self.node_filter = Some(Expression::read(input)?);
        }
        self.parent = ChainLink::from(parent_id);
        self.principal = ChainLink::from(principal_id);
        self.flags |= KernelFlags::PARENT_IS_ID | KernelFlags::PRINCIPAL_IS_ID;
        Ok(())
    }
}

impl Default for KernelBase {
    fn default() -> KernelBase {
        KernelBase::new()
    }
}

impl fmt::Debug for KernelBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state_chars();
        write!(
            f,
            "{{state {}{} id {} old-id {} ret {} src {} dst {} src-app {} dst-app {} parent {:?} principal {:?}}}",
            state[0],
            state[1],
            self.id,
            self.old_id,
            self.result,
            self.source,
            self.destination,
            self.source_application_id(),
            self.target_application_id(),
            self.parent,
            self.principal,
        )
    }
}

/// Deferred routing decisions made by user code during `act`/`react`. The
/// dispatcher drains the context after the callback returns, outside any
/// queue lock, so kernels may submit freely without re-entrancy concerns.
#[derive(Default)]
pub struct Context {
    pub(crate) local: Vec<KernelPtr>,
    pub(crate) remote: Vec<KernelPtr>,
}

impl Context {
    pub fn new() -> Context {
        Context::default()
    }

    /// Submit `child` as a subordinate of `parent` to the local pipeline.
    /// The parent becomes suspended and is parked in the instance registry
    /// until its completions return.
    pub fn upstream(&mut self, parent: &mut KernelBase, mut child: KernelPtr) {
        let id = parent.ensure_id();
        child.base_mut().set_parent_id(id);
        parent.setf(KernelFlags::PARKED);
        self.local.push(child);
    }

    /// As `upstream`, but toward the cluster: the remote pipeline picks a
    /// peer by weighted round-robin.
    pub fn upstream_remote(&mut self, parent: &mut KernelBase, mut child: KernelPtr) {
        let id = parent.ensure_id();
        child.base_mut().set_parent_id(id);
        parent.setf(KernelFlags::PARKED);
        self.remote.push(child);
    }

    /// As `upstream`, embedding the parent into the child's serialized form
    /// so the child can execute or recover without prior state on the
    /// receiving side.
    pub fn upstream_remote_carry(&mut self, parent: &mut KernelBase, mut child: KernelPtr) {
        let id = parent.ensure_id();
        child.base_mut().set_parent_id(id);
        child.base_mut().setf(KernelFlags::CARRIES_PARENT);
        parent.setf(KernelFlags::PARKED);
        self.remote.push(child);
    }

    /// Submit an unrelated kernel to the local pipeline.
    pub fn send(&mut self, k: KernelPtr) {
        self.local.push(k);
    }

    /// Submit an unrelated kernel to the remote pipeline.
    pub fn send_remote(&mut self, k: KernelPtr) {
        self.remote.push(k);
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_empty() && self.remote.is_empty()
    }
}

/// A unit of work. Implementations override `act` (perform or fan out),
/// `react` (collect a completing subordinate) and optionally `rollback`
/// (undo partial effects when execution fails).
///
/// `write`/`read` serialize the kernel body; overrides must call the base
/// first, so the wire order matches the packet layout.
pub trait Kernel: Any + Send {
    fn base(&self) -> &KernelBase;
    fn base_mut(&mut self) -> &mut KernelBase;

    fn act(&mut self, _ctx: &mut Context) {}

    fn react(&mut self, _ctx: &mut Context, _child: KernelPtr) {
        panic!("empty react");
    }

    /// Called instead of `react` when the child completed with an error.
    fn error(&mut self, ctx: &mut Context, child: KernelPtr) {
        self.react(ctx, child);
    }

    fn rollback(&mut self, _ctx: &mut Context) {}

    fn write(&self, out: &mut KernelBuffer) -> Result<()> {
        self.base().write(out)
    }

    fn read(&mut self, input: &mut KernelBuffer) -> Result<()> {
        self.base_mut().read(input)
    }

    fn is_foreign(&self) -> bool {
        false
    }

    /// The concrete type of this kernel, as registered in the type
    /// registry. Implementations never override this.
    fn type_index(&self) -> std::any::TypeId {
        std::any::TypeId::of::<Self>()
    }
}

pub type KernelPtr = Box<dyn Kernel>;

impl dyn Kernel {
    pub fn is<T: Kernel>(&self) -> bool {
        self.type_index() == std::any::TypeId::of::<T>()
    }

    pub fn downcast<T: Kernel>(self: Box<Self>) -> std::result::Result<Box<T>, KernelPtr> {
        if self.is::<T>() {
            let raw = Box::into_raw(self);
            Ok(unsafe { Box::from_raw(raw as *mut T) })
        } else {
            Err(self)
        }
    }

    pub fn downcast_ref<T: Kernel>(&self) -> Option<&T> {
        if self.is::<T>() {
            Some(unsafe { &*(self as *const dyn Kernel as *const T) })
        } else {
            None
        }
    }

    pub fn downcast_mut<T: Kernel>(&mut self) -> Option<&mut T> {
        if self.is::<T>() {
            Some(unsafe { &mut *(self as *mut dyn Kernel as *mut T) })
        } else {
            None
        }
    }
}

impl fmt::Debug for dyn Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.base().fmt(f)
    }
}

/// An opaque kernel addressed to another application: only the header is
/// understood here, the body is forwarded verbatim.
pub struct ForeignKernel {
    base: KernelBase,
    payload: Vec<u8>,
}

impl ForeignKernel {
    pub fn new() -> ForeignKernel {
        ForeignKernel {
            base: KernelBase::new(),
            payload: Vec::new(),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

impl Default for ForeignKernel {
    fn default() -> ForeignKernel {
        ForeignKernel::new()
    }
}

impl Kernel for ForeignKernel {
    fn base(&self) -> &KernelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut KernelBase {
        &mut self.base
    }

    fn write(&self, out: &mut KernelBuffer) -> Result<()> {
        out.write_raw(&self.payload);
        Ok(())
    }

    fn read(&mut self, input: &mut KernelBuffer) -> Result<()> {
        self.payload = input.read_remaining();
        Ok(())
    }

    fn is_foreign(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Plain {
        base: KernelBase,
    }

    impl Plain {
        fn new() -> Plain {
            Plain {
                base: KernelBase::new(),
            }
        }
    }

    impl Kernel for Plain {
        fn base(&self) -> &KernelBase {
            &self.base
        }
        fn base_mut(&mut self) -> &mut KernelBase {
            &mut self.base
        }
    }

    #[test]
    fn phase_is_derived_from_result_principal_parent() {
        let mut k = Plain::new();
        assert_eq!(k.base().phase(), Phase::Broadcast);
        k.base_mut().set_parent_id(7);
        assert_eq!(k.base().phase(), Phase::Upstream);
        k.base_mut().set_principal_id(7);
        assert_eq!(k.base().phase(), Phase::PointToPoint);
        k.base_mut().set_result(ExitCode::Success);
        assert_eq!(k.base().phase(), Phase::Downstream);
    }

    #[test]
    fn return_to_parent_mirrors_source() {
        let mut k = Plain::new();
        k.base_mut().set_parent_id(42);
        k.base_mut()
            .set_source(SocketAddress::new_abstract(b"origin"));
        k.base_mut().return_to_parent(ExitCode::Success);
        assert_eq!(k.base().principal_id(), 42);
        assert_eq!(k.base().result(), ExitCode::Success);
        assert_eq!(
            *k.base().destination(),
            SocketAddress::new_abstract(b"origin")
        );
        assert!(k.base().moves_downstream());
    }

    #[test]
    fn recurse_points_principal_at_self() {
        let mut k = Plain::new();
        k.base_mut().recurse();
        assert!(k.base().has_id());
        assert_eq!(k.base().principal_id(), k.base().id());
    }

    #[test]
    fn do_not_delete_is_a_flag() {
        let mut k = Plain::new();
        k.base_mut().setf(KernelFlags::DO_NOT_DELETE);
        assert!(k.base().isset(KernelFlags::DO_NOT_DELETE));
        k.base_mut().unsetf(KernelFlags::DO_NOT_DELETE);
        assert!(!k.base().isset(KernelFlags::DO_NOT_DELETE));
    }

    #[test]
    fn ids_are_monotonic() {
        let a = next_kernel_id();
        let b = next_kernel_id();
        assert!(b > a);
        assert!(a > NETWORK_MASTER_ID);
    }
}
