//! Qdisc requests for the tunnel link, sent over an [`rtnetlink::Handle`].
//!
//! The link gets an `fq` root qdisc, which honours the departure timestamps
//! the classifier writes, and a `clsact` qdisc that hosts the classifier at
//! ingress and egress.

use std::num::NonZeroI32;

use futures::StreamExt as _;
use rtnetlink::packet_core::{
    NLM_F_ACK, NLM_F_CREATE, NLM_F_EXCL, NLM_F_REPLACE, NLM_F_REQUEST, NetlinkMessage,
    NetlinkPayload,
};
use rtnetlink::packet_route::{
    RouteNetlinkMessage,
    tc::{TcAttribute, TcHandle, TcMessage},
};

use tracing::debug;

use crate::error::TunnelError;

/// `ffff:0`, the handle every clsact qdisc carries.
pub const CLSACT_HANDLE: u32 = 0xFFFF_0000;
/// `TC_H_CLSACT`, the pseudo-parent clsact attaches under.
pub const CLSACT_PARENT: u32 = 0xFFFF_FFF1;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum QdiscOp {
    Replace,
    Create,
    Delete,
}

/// Builds a qdisc request for `kind` on the link at `if_index`.
pub fn qdisc_request(
    if_index: i32,
    kind: &str,
    parent: TcHandle,
    handle: TcHandle,
    op: QdiscOp,
) -> NetlinkMessage<RouteNetlinkMessage> {
    let mut tc_message = TcMessage::with_index(if_index);
    tc_message.header.parent = parent;
    tc_message.header.handle = handle;
    tc_message.attributes.push(TcAttribute::Kind(kind.to_string()));

    let (payload, flags) = match op {
        QdiscOp::Replace => (
            RouteNetlinkMessage::NewQueueDiscipline(tc_message),
            NLM_F_CREATE | NLM_F_REPLACE | NLM_F_REQUEST | NLM_F_ACK,
        ),
        QdiscOp::Create => (
            RouteNetlinkMessage::NewQueueDiscipline(tc_message),
            NLM_F_CREATE | NLM_F_EXCL | NLM_F_REQUEST | NLM_F_ACK,
        ),
        QdiscOp::Delete => (
            RouteNetlinkMessage::DelQueueDiscipline(tc_message),
            NLM_F_REQUEST | NLM_F_ACK,
        ),
    };

    let mut nl_req = NetlinkMessage::from(payload);
    nl_req.header.flags = flags;
    nl_req
}

pub fn fq_root(if_index: i32) -> NetlinkMessage<RouteNetlinkMessage> {
    qdisc_request(
        if_index,
        "fq",
        TcHandle::ROOT,
        TcHandle::default(),
        QdiscOp::Replace,
    )
}

pub fn clsact(if_index: i32, op: QdiscOp) -> NetlinkMessage<RouteNetlinkMessage> {
    qdisc_request(
        if_index,
        "clsact",
        TcHandle::from(CLSACT_PARENT),
        TcHandle::from(CLSACT_HANDLE),
        op,
    )
}

/// Sends `request` and waits for the kernel's acknowledgement. Errors whose
/// errno is listed in `tolerated` count as success.
pub async fn send(
    handle: &rtnetlink::Handle,
    request: NetlinkMessage<RouteNetlinkMessage>,
    tolerated: &[i32],
) -> Result<(), TunnelError> {
    let mut res = handle.clone().request(request)?;
    while let Some(msg) = res.next().await {
        if let NetlinkPayload::Error(e) = msg.payload {
            let Some(code) = e.code.map(NonZeroI32::get) else {
                continue;
            };
            if tolerated.contains(&-code) {
                debug!(errno = -code, "tolerated netlink error");
                continue;
            }
            return Err(TunnelError::Netlink(rtnetlink::Error::NetlinkError(e)));
        }
    }
    Ok(())
}

pub async fn replace_fq_root(handle: &rtnetlink::Handle, if_index: i32) -> Result<(), TunnelError> {
    debug!(if_index, "replacing root qdisc with fq");
    send(handle, fq_root(if_index), &[]).await
}

/// Deletes any clsact qdisc on the link (dropping filters attached to it)
/// and installs a fresh one.
pub async fn reset_clsact(handle: &rtnetlink::Handle, if_index: i32) -> Result<(), TunnelError> {
    debug!(if_index, "resetting clsact qdisc");
    send(
        handle,
        clsact(if_index, QdiscOp::Delete),
        &[libc::ENOENT, libc::EINVAL],
    )
    .await?;
    send(handle, clsact(if_index, QdiscOp::Create), &[]).await
}
