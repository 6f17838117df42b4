use clap::{crate_version, App, Arg, SubCommand};
use crosstalk::Handlers;

#[tokio::main]
async fn main() {
    env_logger::init();

    let matches = App::new("crosstalk")
        .version(crate_version!())
        .subcommand(
            SubCommand::with_name("serve")
                .about("Run an echo responder")
                .arg(Arg::with_name("addr").required(true).index(1)),
        )
        .subcommand(
            SubCommand::with_name("request")
                .about("Send one request and print the reply")
                .arg(Arg::with_name("addr").required(true).index(1))
                .arg(Arg::with_name("op").required(true).index(2))
                .arg(Arg::with_name("payload").index(3)),
        )
        .get_matches();

    match matches.subcommand() {
        ("serve", Some(m)) => {
            let addr = m.value_of("addr").expect("missing addr");
            let handlers = Handlers::new();
            handlers.handle("echo", |_sock, _op, payload| async move {
                Ok::<_, anyhow::Error>(payload)
            });
            let server = crosstalk::listen(addr, handlers).await.expect("listen");
            println!("listening at {}", server.local_addr().unwrap_or_default());
            if let Err(err) = server.accept().await {
                eprintln!("{:#?}", err);
            }
        }
        ("request", Some(m)) => {
            let addr = m.value_of("addr").expect("missing addr");
            let op = m.value_of("op").expect("missing op");
            let payload = m.value_of("payload").unwrap_or("");
            match crosstalk::connect(addr, Handlers::new()).await {
                Ok(sock) => match sock.buffer_request(op, payload.as_bytes()).await {
                    Ok(reply) => println!("{}", String::from_utf8_lossy(&reply)),
                    Err(err) => eprintln!("{:#?}", err),
                },
                Err(err) => eprintln!("{:#?}", err),
            }
        }
        _ => eprintln!("missing subcommand; try `serve` or `request`"),
    }
}
