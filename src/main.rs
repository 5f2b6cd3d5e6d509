use std::sync::Arc;

use clap::{Command, Arg, ArgAction, ArgMatches};
use rocket::tokio::select;
use url::Url;

use camera_status_board::client::{HttpCameraClient, DEFAULT_SERVER_URL};
use camera_status_board::common::{CameraId, CameraRecord};
use camera_status_board::config::ConfigManager;
use camera_status_board::rest_api;
use camera_status_board::viewer::{CameraSource, Reconciler};



fn server_arg() -> Arg {
	Arg::new("server")
		.short('s')
		.long("server")
		.value_parser(Url::parse)
		.default_value(DEFAULT_SERVER_URL)
		.help("Base URL of the camera status board server")
}

fn status_arg() -> Arg {
	Arg::new("status")
		.required(true)
		.value_parser(["online", "offline"])
		.help("New camera status")
}

fn cli() -> Command {
	Command::new("camera-status-board")
		.version("0.1.0")
		.about("Camera status dashboard with live updates.")
		.subcommand_required(true)
		.subcommand(
			Command::new("serve")
				.about("Run the HTTP server")
				.arg(
					Arg::new("config")
						.action(ArgAction::Append)	// Allow argument to be specified multiple times
						.short('c')
						.long("config")
						.help("TOML file with board config")
				)
		)
		.subcommand(
			Command::new("list")
				.about("Print the camera status table")
				.arg(server_arg())
		)
		.subcommand(
			Command::new("add")
				.about("Add a camera")
				.arg(Arg::new("name").required(true).help("Camera name"))
				.arg(status_arg())
				.arg(server_arg())
		)
		.subcommand(
			Command::new("set")
				.about("Change a camera's status")
				.arg(Arg::new("id").required(true).help("Camera id"))
				.arg(status_arg())
				.arg(server_arg())
				.arg(
					Arg::new("token")
						.short('t')
						.long("token")
						.env("BOARD_TOKEN")
						.help("Bearer token for servers that require authentication")
				)
		)
		.subcommand(
			Command::new("watch")
				.about("Show the camera status table and keep it up to date")
				.arg(server_arg())
		)
}

#[rocket::main]
async fn main() -> anyhow::Result<()> {
	let matches = cli().get_matches();

	match matches.subcommand() {
		Some(("serve", args)) => serve(args).await,
		Some((command, args)) => {
			env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
			run_client(command, args).await
		},
		None => anyhow::bail!("no command given"),
	}
}

async fn serve(args: &ArgMatches) -> anyhow::Result<()> {
	let mut config_manager = ConfigManager::new();
	let config_filename_matches = args.get_many::<String>("config");
	match config_filename_matches {
		Some(filenames) => {
			config_manager.read_config(filenames.map(|v| v.as_str()).collect())?;
		},
		None => {
			// Use default file path
			config_manager.read_default_config_files()?;
		}
	};
	let board = config_manager.board()?;

	rest_api::attach(rocket::custom(config_manager.figment()), &board)?
		.launch()
		.await?;

	anyhow::Ok(())
}

async fn run_client(command: &str, args: &ArgMatches) -> anyhow::Result<()> {
	let server = args.get_one::<Url>("server").cloned()
		.ok_or_else(|| anyhow::anyhow!("missing --server"))?;
	let token = args.try_get_one::<String>("token").ok().flatten().cloned();
	let client = HttpCameraClient::new(server, token);

	match command {
		"list" => {
			print_table(&client.list_all().await?);
		},
		"add" => {
			let camera = client.add(required(args, "name")?, required(args, "status")?).await?;
			println!("Added camera {} ({})", camera.id, camera.name);
		},
		"set" => {
			let id = CameraId::new(required(args, "id")?);
			let camera = client.set_status(&id, required(args, "status")?).await?;
			println!("Camera {} ({}) is now {}", camera.id, camera.name, camera.status);
		},
		"watch" => watch(client).await?,
		other => anyhow::bail!("unknown command {}", other),
	}
	anyhow::Ok(())
}

fn required<'a>(args: &'a ArgMatches, name: &str) -> anyhow::Result<&'a str> {
	args.get_one::<String>(name)
		.map(|value| value.as_str())
		.ok_or_else(|| anyhow::anyhow!("missing {}", name))
}

async fn watch(client: HttpCameraClient) -> anyhow::Result<()> {
	// Subscribe before the initial fetch so no update falls between the two.
	let feed = client.subscribe().await?;
	let source: Arc<dyn CameraSource> = Arc::new(client);
	let mut reconciler = Reconciler::mount(source, feed).await?;
	let mut changes = reconciler.changes();

	print_table(&reconciler.snapshot());
	loop {
		select! {
			changed = changes.changed() => {
				if changed.is_err() {
					break;
				}
				print_table(&reconciler.snapshot());
			},
			_ = rocket::tokio::signal::ctrl_c() => break,
		}
	}
	reconciler.unsubscribe();
	anyhow::Ok(())
}

fn print_table(cameras: &[CameraRecord]) {
	let name_width = cameras.iter()
		.map(|camera| camera.name.chars().count())
		.max()
		.unwrap_or(0)
		.max("Room".len());
	let id_width = cameras.iter()
		.map(|camera| camera.id.as_str().len())
		.max()
		.unwrap_or(0)
		.max("Device ID".len());

	println!();
	println!("{:<name_width$}  {:<id_width$}  Status", "Room", "Device ID");
	for camera in cameras {
		println!("{:<name_width$}  {:<id_width$}  {}", camera.name, camera.id.as_str(), camera.status);
	}
}
