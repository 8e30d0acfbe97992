//! Built-in resource kinds
//!
//! The catalog the CLI validates stacks against. Properties not listed as
//! mutable force a replace when they change.
//!
//! A "private" subnet is not a kind of its own: it is a `subnet` with no
//! route to an `internet_gateway` (no `route_table_association` pointing at
//! a route table with a gateway route), combined with `security_rule`s that
//! only admit traffic from inside the network. The provisioning API has no
//! stronger isolation primitive, so nothing here enforces it.

use declarative::{KindCatalog, KindSchema};

/// Static description of one kind
pub struct KindSpec {
    pub name: &'static str,
    /// Prefix of remote identifiers handed out by the sandbox
    pub id_prefix: &'static str,
    pub description: &'static str,
    /// Properties a create request must carry
    pub required: &'static [&'static str],
    pub mutable: &'static [&'static str],
    /// Exported attributes besides `id`
    pub outputs: &'static [&'static str],
}

pub const KINDS: &[KindSpec] = &[
    KindSpec {
        name: "network",
        id_prefix: "net",
        description: "Isolated virtual network",
        required: &["cidr_block"],
        mutable: &["enable_dns", "tags"],
        outputs: &["cidr_block"],
    },
    KindSpec {
        name: "subnet",
        id_prefix: "subnet",
        description: "Address range inside a network",
        required: &["network_id", "cidr_block"],
        mutable: &["map_public_ip", "tags"],
        outputs: &["cidr_block", "availability_zone"],
    },
    KindSpec {
        name: "internet_gateway",
        id_prefix: "igw",
        description: "Route between a network and the internet",
        required: &["network_id"],
        mutable: &["tags"],
        outputs: &[],
    },
    KindSpec {
        name: "nat_gateway",
        id_prefix: "nat",
        description: "Outbound-only internet access for private subnets",
        required: &["subnet_id"],
        mutable: &["tags"],
        outputs: &["public_ip"],
    },
    KindSpec {
        name: "route_table",
        id_prefix: "rtb",
        description: "Routing rules for associated subnets",
        required: &["network_id"],
        mutable: &["routes", "tags"],
        outputs: &[],
    },
    KindSpec {
        name: "route_table_association",
        id_prefix: "rtbassoc",
        description: "Binds a subnet to a route table",
        required: &["route_table_id", "subnet_id"],
        mutable: &[],
        outputs: &[],
    },
    KindSpec {
        name: "security_group",
        id_prefix: "sg",
        description: "Stateful firewall attached to instances",
        required: &["network_id"],
        mutable: &["description", "tags"],
        outputs: &[],
    },
    KindSpec {
        name: "security_rule",
        id_prefix: "sgr",
        description: "One ingress or egress rule of a security group",
        required: &["security_group_id", "direction", "protocol"],
        mutable: &["cidr_blocks", "description"],
        outputs: &[],
    },
    KindSpec {
        name: "compute_instance",
        id_prefix: "i",
        description: "Virtual machine",
        required: &["image", "machine_type", "subnet_id"],
        mutable: &["security_group_ids", "tags"],
        outputs: &["private_ip", "public_ip", "public_dns"],
    },
    KindSpec {
        name: "storage_bucket",
        id_prefix: "bucket",
        description: "Object storage bucket",
        required: &["bucket_name"],
        mutable: &["versioning", "public_read", "tags"],
        outputs: &["url", "domain_name"],
    },
    KindSpec {
        name: "policy_binding",
        id_prefix: "pb",
        description: "Grants a role on a resource to a principal",
        required: &["principal", "role", "resource"],
        mutable: &["description"],
        outputs: &[],
    },
];

/// Look up a built-in kind
pub fn spec(kind: &str) -> Option<&'static KindSpec> {
    KINDS.iter().find(|k| k.name == kind)
}

/// Catalog of every built-in kind
pub fn catalog() -> KindCatalog {
    let mut catalog = KindCatalog::new();
    for kind in KINDS {
        catalog.register(
            KindSchema::new(kind.name)
                .describe(kind.description)
                .mutable(kind.mutable.iter().copied())
                .outputs(kind.outputs.iter().copied()),
        );
    }
    catalog
}
