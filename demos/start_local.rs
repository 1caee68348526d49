use std::fs::OpenOptions;
use std::net::UdpSocket;
use std::sync::atomic::Ordering;

use tsp_local::{
    BoxError, DescriptorBuilder, IcmpKeepalive, LocalSetup, Posix, Settings, TemplateScript,
};

// sudo cargo run --example start-local -- tsp-local.conf
fn main() -> Result<(), BoxError> {
    let settings = match std::env::args().nth(1) {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    let mut logger = env_logger::Builder::new();
    logger.filter_level(settings.level_filter()).parse_default_env();
    if let Some(path) = settings.local.log_path() {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        logger.target(env_logger::Target::Pipe(Box::new(file)));
    }
    logger.init();

    let keepalive = IcmpKeepalive::new();
    let stop = keepalive.stop_handle();
    let handle = ctrlc2::set_handler(move || {
        stop.store(true, Ordering::Relaxed);
        true
    })
    .expect("Error setting Ctrl-C handler");

    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("198.51.100.1:3653")?;
    let tunnel = DescriptorBuilder::new()
        .mode_str("v6v4")
        .ipv4("192.0.2.10", "198.51.100.1")
        .ipv6("2001:db8::2", "2001:db8::1")
        .keepalive("30")
        .build()?;

    let setup = LocalSetup::new(
        Posix,
        TemplateScript::from_config(&settings.local),
        keepalive,
        settings.local.clone(),
    );
    let outcome = setup.start(&socket, &tunnel, &settings.tools)?;
    log::info!("local setup finished: {}", outcome.status());
    drop(handle);
    Ok(())
}
