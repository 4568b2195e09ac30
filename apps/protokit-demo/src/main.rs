mod echo;
mod logging;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use mimalloc::MiMalloc;
use protokit::render::render_all;
use protokit::testing::{bind_in_memory, request, request_stream};
use protokit::{Message, MessageError, ProtokitConfig, SchemaRegistry, Server};
use protokit_transport_grpc::{GrpcRouter, serve};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Protokit demo - declares a sample service and exercises the pipeline
#[derive(Parser)]
#[command(name = "protokit-demo")]
#[command(about = "Protokit demo - declarative protobuf schemas and RPC dispatch")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Root directory for generated artifacts (overrides config)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print effective configuration (JSON) and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the rendered .proto text for every output file
    Render,
    /// Render, compile with protoc and write artifacts
    Generate,
    /// Bind the sample service and call every method in-process
    Run {
        /// Bind from in-memory descriptors instead of invoking protoc
        #[arg(long)]
        in_memory: bool,
    },
    /// Bind the sample service and serve it over gRPC until Ctrl-C
    Serve {
        /// Bind from in-memory descriptors instead of invoking protoc
        #[arg(long)]
        in_memory: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut overrides = serde_json::Map::new();
    if let Some(output) = &cli.output {
        overrides.insert(
            "codegen".to_owned(),
            serde_json::json!({ "output_root": output }),
        );
    }
    let config = ProtokitConfig::load_with(cli.config.as_deref(), &overrides)?;

    logging::init_logging(&config.logging, cli.verbose);

    if cli.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.server.max_workers.max(1))
        .enable_all()
        .build()?;

    let registry = SchemaRegistry::new();
    let api = echo::declare(&registry)?;
    let mut server = Server::new(registry.clone(), config);
    server.add_service(&api.service);

    match cli.command.unwrap_or(Commands::Run { in_memory: true }) {
        Commands::Render => {
            for (file, text) in render_all(&registry) {
                println!("// {file}.proto\n{text}");
            }
            Ok(())
        }
        Commands::Generate => {
            server.generate()?;
            tracing::info!(
                output = %server.config().codegen.output_dir().display(),
                "artifacts written"
            );
            Ok(())
        }
        Commands::Run { in_memory } => {
            bind(&mut server, &registry, in_memory)?;
            runtime.block_on(exercise(&server, &api))
        }
        Commands::Serve { in_memory } => {
            bind(&mut server, &registry, in_memory)?;
            let addr = server.config().server.socket_addr()?;
            let router = GrpcRouter::new(&server);
            runtime.block_on(serve(router, addr, async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!(error = %e, "failed to listen for Ctrl-C");
                }
                tracing::info!("shutdown requested");
            }))
        }
    }
}

fn bind(server: &mut Server, registry: &SchemaRegistry, in_memory: bool) -> Result<()> {
    if in_memory {
        server.bind_pool(bind_in_memory(registry)?)?;
    } else {
        server.start()?;
    }
    Ok(())
}

async fn exercise(server: &Server, api: &echo::EchoApi) -> Result<()> {
    let router = GrpcRouter::new(server);
    for path in router.paths() {
        tracing::info!(path, "route");
    }

    let method = |name: &str| {
        server
            .method(api.service.name(), name)
            .ok_or_else(|| anyhow::anyhow!("method {name} is not registered"))
    };
    let greeting = |text: &str| -> Result<Message, MessageError> {
        Message::new(&api.greeting)?.with("text", text)
    };
    let number = |value: i64| -> Result<Message, MessageError> {
        Message::new(&api.number)?.with("value", value)
    };

    for name in ["Say", "Shout"] {
        let response = method(name)?.call_unary(request(greeting("hello")?)).await?;
        let reply = Message::from_wire(&api.greeting, response.into_inner())?;
        tracing::info!(method = name, reply = %reply.to_json_string()?, "unary");
    }

    let mut countdown = method("Countdown")?
        .call_server_streaming(request(number(3)?))
        .await?
        .into_inner();
    let mut received = Vec::new();
    while let Some(item) = countdown.next().await {
        received.push(Message::from_wire(&api.number, item?)?);
    }
    tracing::info!(items = received.len(), "countdown");

    let total = method("Sum")?
        .call_client_streaming(request_stream(received))
        .await?;
    let total = Message::from_wire(&api.number, total.into_inner())?;
    tracing::info!(total = total.get::<i64>("value")?, "sum");

    let lines = vec![greeting("one")?, greeting("two")?];
    let mut chat = method("Chat")?
        .call_streaming(request_stream(lines))
        .await?
        .into_inner();
    while let Some(item) = chat.next().await {
        let reply = Message::from_wire(&api.greeting, item?)?;
        tracing::info!(reply = %reply.get::<String>("text")?, "chat");
    }
    Ok(())
}
