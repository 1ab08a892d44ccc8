// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of pipeman

//! Synchronous rtnetlink plumbing: qdisc queries, clsact teardown and link
//! dumps carrying the live XDP program id per interface.

use std::{cell::RefCell, io};

use netlink_packet_core::{
    NLM_F_ACK, NLM_F_DUMP, NLM_F_REQUEST, NetlinkMessage, NetlinkPayload,
};
use netlink_packet_route::{
    RouteNetlinkMessage,
    link::{LinkAttribute, LinkMessage, LinkXdp},
    tc::{TcAttribute, TcHandle, TcMessage},
};
use netlink_sys::{Socket, SocketAddr, constants::NETLINK_ROUTE};

// clsact is addressed as handle ffff:0 under the reserved ingress parent.
const CLSACT_HANDLE: TcHandle = TcHandle {
    major: 0xffff,
    minor: 0,
};
const CLSACT_PARENT: TcHandle = TcHandle {
    major: 0xffff,
    minor: 0xfff1,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LinkDetails {
    pub(crate) index: u32,
    pub(crate) name: String,
    /// Live XDP program id on the interface, `0` when nothing is attached.
    pub(crate) xdp_prog_id: u32,
}

pub(crate) struct NetlinkManager {
    sock: RefCell<Socket>,
}

impl NetlinkManager {
    pub(crate) fn new() -> io::Result<Self> {
        let mut socket = Socket::new(NETLINK_ROUTE)?;
        socket.bind_auto()?;
        socket.connect(&SocketAddr::new(0, 0))?;
        Ok(NetlinkManager {
            sock: RefCell::new(socket),
        })
    }

    /// Returns true if a qdisc of the given kind sits on `if_index`.
    pub(crate) fn has_qdisc(&self, qdisc_name: &str, if_index: i32) -> io::Result<bool> {
        let mut req =
            NetlinkMessage::from(RouteNetlinkMessage::GetQueueDiscipline(TcMessage::default()));
        req.header.flags = NLM_F_REQUEST | NLM_F_DUMP;

        let mut found = false;
        self.request(req, |payload| {
            if let RouteNetlinkMessage::NewQueueDiscipline(qdisc) = payload {
                if qdisc.header.index == if_index
                    && qdisc
                        .attributes
                        .contains(&TcAttribute::Kind(qdisc_name.to_string()))
                {
                    found = true;
                }
            }
        })?;
        Ok(found)
    }

    /// Destroys the combined ingress/egress hook on an interface, taking
    /// every attached filter with it. ENOENT surfaces to the caller, which
    /// tolerates it.
    pub(crate) fn qdisc_del_clsact(&self, if_index: u32) -> io::Result<()> {
        let mut tc = TcMessage::default();
        tc.header.index = if_index as i32;
        tc.header.handle = CLSACT_HANDLE;
        tc.header.parent = CLSACT_PARENT;
        tc.attributes.push(TcAttribute::Kind("clsact".to_string()));

        let mut req = NetlinkMessage::from(RouteNetlinkMessage::DelQueueDiscipline(tc));
        req.header.flags = NLM_F_REQUEST | NLM_F_ACK;
        self.request(req, |_| {})
    }

    /// Dumps every system interface with its live XDP program id.
    pub(crate) fn dump_links(&self) -> io::Result<Vec<LinkDetails>> {
        let mut req = NetlinkMessage::from(RouteNetlinkMessage::GetLink(LinkMessage::default()));
        req.header.flags = NLM_F_REQUEST | NLM_F_DUMP;

        let mut links = Vec::new();
        self.request(req, |payload| {
            if let RouteNetlinkMessage::NewLink(msg) = payload {
                links.push(parse_link(msg));
            }
        })?;
        Ok(links)
    }

    /// Sends one request and feeds every inner reply message to `handle`,
    /// draining the socket through the terminating ack/done message. Replies
    /// arrive batched, several netlink messages per datagram.
    fn request<F>(&self, mut req: NetlinkMessage<RouteNetlinkMessage>, mut handle: F) -> io::Result<()>
    where
        F: FnMut(RouteNetlinkMessage),
    {
        req.finalize();
        let mut buf = vec![0; req.header.length as usize];
        req.serialize(&mut buf);

        let socket = self.sock.borrow_mut();
        socket.send(&buf, 0)?;

        let mut receive_buffer = vec![0; 65536];
        loop {
            let n = socket.recv(&mut &mut receive_buffer[..], 0)?;
            let mut offset = 0;
            while offset < n {
                let rx_packet: NetlinkMessage<RouteNetlinkMessage> =
                    NetlinkMessage::deserialize(&receive_buffer[offset..n])
                        .map_err(io::Error::other)?;
                let length = rx_packet.header.length as usize;
                match rx_packet.payload {
                    NetlinkPayload::Done(_) => return Ok(()),
                    NetlinkPayload::Error(e) => {
                        return match e.code {
                            // An error message without a code is the ack.
                            None => Ok(()),
                            Some(code) => Err(io::Error::from_raw_os_error(-code.get())),
                        };
                    }
                    NetlinkPayload::InnerMessage(payload) => handle(payload),
                    _ => {}
                }
                if length == 0 {
                    break;
                }
                offset += length;
            }
        }
    }
}

fn parse_link(msg: LinkMessage) -> LinkDetails {
    let mut name = String::new();
    let mut xdp_prog_id = 0;
    for attr in msg.attributes {
        match attr {
            LinkAttribute::IfName(ifname) => name = ifname,
            LinkAttribute::Xdp(xdp) => {
                for nla in xdp {
                    if let LinkXdp::ProgId(id) = nla {
                        xdp_prog_id = id;
                    }
                }
            }
            _ => {}
        }
    }
    LinkDetails {
        index: msg.header.index,
        name,
        xdp_prog_id,
    }
}
