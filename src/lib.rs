/*!
Privileged local setup of a tunnel interface.

Once the tunnel socket is up and the broker has handed out the tunnel
parameters, [`LocalSetup`] checks for root, detaches into the background,
runs the platform configuration script in a forked child that does not
inherit the tunnel socket, reaps it, and then keeps the tunnel alive if a
keepalive interval was negotiated.

# Example:
```no_run
use std::net::UdpSocket;
use tsp_local::{DescriptorBuilder, IcmpKeepalive, LocalSetup, Posix, Settings, TemplateScript};

let settings = Settings::load("tsp-local.conf")?;
let socket = UdpSocket::bind("0.0.0.0:0")?;
let tunnel = DescriptorBuilder::new()
    .mode_str("v6v4")
    .ipv4("192.0.2.10", "198.51.100.1")
    .ipv6("2001:db8::2", "2001:db8::1")
    .keepalive("30")
    .build()?;
let setup = LocalSetup::new(
    Posix,
    TemplateScript::from_config(&settings.local),
    IcmpKeepalive::new(),
    settings.local.clone(),
);
let outcome = setup.start(&socket, &tunnel, &settings.tools)?;
println!("{}", outcome.status());
# Ok::<(), tsp_local::BoxError>(())
```
*/

#![cfg_attr(docsrs, feature(doc_cfg))]
#[cfg(not(unix))]
compile_error!("tsp-local only supports unix targets");

pub use crate::builder::{DescriptorBuilder, ToIpv4Address, ToIpv6Address};
pub use crate::configuration::*;
pub use crate::error::{BoxError, Error, Result, Status};
pub use crate::keepalive::{IcmpKeepalive, Keepalive};
pub use crate::local::{mode_supported, start_local, LocalSetup, SetupOutcome};
pub use crate::platform::{Fork, Pid, Posix, ProcessControl, ProcessOutcome};
pub use crate::script::{script_env, ScriptRunner, TemplateScript};

mod builder;
mod configuration;
mod error;
mod keepalive;
mod local;
pub mod platform;
mod script;
