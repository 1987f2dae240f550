// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The listen element / listen list model (§3): a reference-counted,
//! ordered sequence of `(port, address-family ACL, optional TLS context,
//! optional key/cert)`.
//!
//! Only the manager mutates the list; readers take an attach/detach pair
//! (§5, "Shared resources").

use std::net::IpAddr;
use std::sync::Arc;

use rustls::ServerConfig;

/// A coarse address-family/network allow-list for a listen element.
///
/// This is not the DNS ACL language (that lives in the configuration
/// parser, an external collaborator) — just the minimal family/subnet test
/// the netmgr itself needs to decide whether to accept on a given
/// interface.
#[derive(Debug, Clone)]
pub enum AddressFamilyAcl {
    /// Accept only IPv4 peers.
    V4Only,
    /// Accept only IPv6 peers.
    V6Only,
    /// Accept both families.
    Any,
}

impl AddressFamilyAcl {
    /// Whether `addr` is permitted by this ACL.
    pub fn allows(&self, addr: IpAddr) -> bool {
        match self {
            AddressFamilyAcl::V4Only => addr.is_ipv4(),
            AddressFamilyAcl::V6Only => addr.is_ipv6(),
            AddressFamilyAcl::Any => true,
        }
    }
}

/// One entry of a listen list: a port, an address-family ACL, and an
/// optional TLS server configuration.
#[derive(Debug, Clone)]
pub struct ListenElement {
    /// Port to listen on.
    pub port: u16,
    /// Address-family ACL applied to incoming peers.
    pub acl: AddressFamilyAcl,
    /// TLS server configuration, if this element is for a TLS or DoH
    /// listener. `None` means plaintext TCP.
    pub tls: Option<Arc<ServerConfig>>,
}

impl ListenElement {
    /// Creates a plaintext listen element.
    pub fn plain(port: u16, acl: AddressFamilyAcl) -> Self {
        Self { port, acl, tls: None }
    }

    /// Creates a TLS (or DoH-over-TLS) listen element.
    pub fn tls(port: u16, acl: AddressFamilyAcl, tls: Arc<ServerConfig>) -> Self {
        Self { port, acl, tls: Some(tls) }
    }
}

/// A reference-counted, ordered sequence of listen elements.
///
/// Cloning a `ListenList` is cheap (`Arc` to the backing vector) and is the
/// "attach" half of the attach/detach discipline; dropping the clone is the
/// "detach" half. Only [`ListenList::from_elements`] (manager-side
/// construction) mutates the underlying sequence.
#[derive(Debug, Clone)]
pub struct ListenList {
    elements: Arc<Vec<ListenElement>>,
}

impl ListenList {
    /// Builds a listen list from an ordered sequence of elements.
    pub fn from_elements(elements: Vec<ListenElement>) -> Self {
        Self { elements: Arc::new(elements) }
    }

    /// Iterates the list in order.
    pub fn iter(&self) -> impl Iterator<Item = &ListenElement> {
        self.elements.iter()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Finds the first element whose ACL allows `addr` and whose port
    /// matches `port`, preserving list order (first match wins).
    pub fn find(&self, port: u16, addr: IpAddr) -> Option<&ListenElement> {
        self.elements.iter().find(|e| e.port == port && e.acl.allows(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn find_honors_order_and_acl() {
        let list = ListenList::from_elements(vec![
            ListenElement::plain(53, AddressFamilyAcl::V6Only),
            ListenElement::plain(53, AddressFamilyAcl::Any),
        ]);

        let addr = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        let found = list.find(53, addr).unwrap();
        assert!(matches!(found.acl, AddressFamilyAcl::Any));
    }

    #[test]
    fn clone_is_cheap_attach() {
        let list = ListenList::from_elements(vec![ListenElement::plain(53, AddressFamilyAcl::Any)]);
        let attached = list.clone();
        assert_eq!(attached.len(), 1);
        drop(attached);
        assert_eq!(list.len(), 1);
    }
}
