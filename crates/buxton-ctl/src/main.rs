//! buxton-ctl — command-line interface to a running buxtond.

use std::sync::Arc;

use anyhow::{bail, Context, Result};

use buxton_core::config::{load_layer_dir, BuxtondConfig};
use buxton_core::model::{Key, Label, Value};
use buxton_core::status::StatusCode;
use buxton_core::BUXTON_SOCKET;
use buxton_services::memory::MemoryBackend;
use buxton_services::persistent::PersistentBackend;
use buxton_services::{AccessRules, BackendModule, BackendRegistry, Caller, Resolver, ResolverError};
use libbuxton::{BuxtonClient, ClientError};

fn print_usage() {
    println!("Usage: buxton-ctl [--socket <path>] [--direct [--layer-dir <path>]] <command>");
    println!();
    println!("  get-<type> <layer> <group> [name]           Read a value");
    println!("  set-<type> <layer> <group> [name] <value>   Write a value");
    println!("  unset-value <layer> <group> [name]          Remove a value");
    println!("  get-label <layer> <group> [name]            Read a key's label");
    println!("  set-label <layer> <group> [name] <label>    Set a key's label");
    println!("  create-group <layer> <group>                Create a group");
    println!("  remove-group <layer> <group>                 Remove a group and its keys");
    println!("  list-keys <layer>                            List keys in a layer");
    println!();
    println!("<type> is one of: string int32 uint32 int64 uint64 float double bool");
    println!();
    println!("Options:");
    println!("  --socket <path>      UNIX socket path (default: {BUXTON_SOCKET})");
    println!("  --direct             Bypass the socket; talk to the backends in-process (requires root)");
    println!("  --layer-dir <path>   Layer config directory for --direct (default: {})",
        BuxtondConfig::default().storage.layer_dir.display());
}

/// Bridges the resolver's synchronous calls to the same surface
/// `BuxtonClient` exposes, so `run` can drive either transport.
struct DirectCtl {
    resolver: Resolver,
    caller: Caller,
}

fn map_resolver_error(e: ResolverError) -> ClientError {
    let code = match e {
        ResolverError::UnknownLayer(_) | ResolverError::LayerRequired => StatusCode::BadArgs,
        ResolverError::NotFound => StatusCode::NotFound,
        ResolverError::AlreadyExists => StatusCode::EExist,
        ResolverError::Denied => StatusCode::EPerm,
        ResolverError::Backend(_) => StatusCode::Failed,
    };
    ClientError::Status(code)
}

fn format_key(key: Key) -> String {
    match key.name {
        Some(name) => format!("{}/{}", key.group, name),
        None => key.group,
    }
}

impl DirectCtl {
    fn open(layer_dir: Option<&str>) -> Result<Self> {
        let config = BuxtondConfig::default();
        let dir = layer_dir
            .map(std::path::PathBuf::from)
            .unwrap_or(config.storage.layer_dir);
        let layers = load_layer_dir(&dir).context("failed to load layer config")?;

        let db_root = config.storage.db_root;
        let mut registry = BackendRegistry::new();
        registry.register(
            "memory",
            Box::new(|| Ok(Arc::new(MemoryBackend::new()) as Arc<dyn BackendModule>)),
        );
        registry.register(
            "persistent",
            Box::new(move || Ok(Arc::new(PersistentBackend::new(db_root.clone())) as Arc<dyn BackendModule>)),
        );

        let resolver = Resolver::new(layers, registry, AccessRules::allow_all());
        Ok(Self {
            resolver,
            caller: Caller::root(Label::default_label()),
        })
    }

    fn get(&self, key: &Key) -> Result<(Value, Label), ClientError> {
        self.resolver.get(&self.caller, key).map_err(map_resolver_error)
    }

    fn set(&self, key: &Key, value: Value) -> Result<(), ClientError> {
        self.resolver.set(&self.caller, key, value).map(|_| ()).map_err(map_resolver_error)
    }

    fn unset(&self, key: &Key) -> Result<(), ClientError> {
        self.resolver.unset(&self.caller, key).map(|_| ()).map_err(map_resolver_error)
    }

    fn create_group(&self, key: &Key) -> Result<(), ClientError> {
        self.resolver.create_group(&self.caller, key).map(|_| ()).map_err(map_resolver_error)
    }

    fn remove_group(&self, key: &Key) -> Result<(), ClientError> {
        self.resolver.remove_group(&self.caller, key).map(|_| ()).map_err(map_resolver_error)
    }

    fn set_label(&self, key: &Key, label: &Label) -> Result<(), ClientError> {
        self.resolver
            .set_label(&self.caller, key, label.clone())
            .map(|_| ())
            .map_err(map_resolver_error)
    }

    fn list(&self, layer: &str) -> Result<Vec<String>, ClientError> {
        self.resolver
            .list(&self.caller, layer)
            .map(|keys| keys.into_iter().map(format_key).collect())
            .map_err(map_resolver_error)
    }
}

/// Either transport `run` can drive: a live socket connection, or a direct
/// in-process resolver call for the privileged `--direct` path.
enum Ctl {
    Socket(BuxtonClient),
    Direct(DirectCtl),
}

impl Ctl {
    async fn get(&self, key: &Key) -> Result<(Value, Label), ClientError> {
        match self {
            Ctl::Socket(c) => c.get(key).await,
            Ctl::Direct(d) => d.get(key),
        }
    }

    async fn set(&self, key: &Key, value: Value) -> Result<(), ClientError> {
        match self {
            Ctl::Socket(c) => c.set(key, value).await,
            Ctl::Direct(d) => d.set(key, value),
        }
    }

    async fn unset(&self, key: &Key) -> Result<(), ClientError> {
        match self {
            Ctl::Socket(c) => c.unset(key).await,
            Ctl::Direct(d) => d.unset(key),
        }
    }

    async fn create_group(&self, key: &Key) -> Result<(), ClientError> {
        match self {
            Ctl::Socket(c) => c.create_group(key).await,
            Ctl::Direct(d) => d.create_group(key),
        }
    }

    async fn remove_group(&self, key: &Key) -> Result<(), ClientError> {
        match self {
            Ctl::Socket(c) => c.remove_group(key).await,
            Ctl::Direct(d) => d.remove_group(key),
        }
    }

    async fn set_label(&self, key: &Key, label: &Label) -> Result<(), ClientError> {
        match self {
            Ctl::Socket(c) => c.set_label(key, label).await,
            Ctl::Direct(d) => d.set_label(key, label),
        }
    }

    async fn list(&self, layer: &str) -> Result<Vec<String>, ClientError> {
        match self {
            Ctl::Socket(c) => c.list(layer).await,
            Ctl::Direct(d) => d.list(layer),
        }
    }
}

fn parse_value(type_name: &str, raw: &str) -> Result<Value> {
    Ok(match type_name {
        "string" => Value::String(raw.to_string()),
        "int32" => Value::Int32(raw.parse().context("not a valid int32")?),
        "uint32" => Value::UInt32(raw.parse().context("not a valid uint32")?),
        "int64" => Value::Int64(raw.parse().context("not a valid int64")?),
        "uint64" => Value::UInt64(raw.parse().context("not a valid uint64")?),
        "float" => Value::Float(raw.parse().context("not a valid float")?),
        "double" => Value::Double(raw.parse().context("not a valid double")?),
        "bool" => Value::Bool(raw.parse().context("not a valid bool")?),
        other => bail!("unknown type {other:?}"),
    })
}

fn print_value(value: &Value, label: &Label) {
    let rendered = match value {
        Value::String(s) => s.clone(),
        Value::Int32(v) => v.to_string(),
        Value::UInt32(v) => v.to_string(),
        Value::Int64(v) => v.to_string(),
        Value::UInt64(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::Double(v) => v.to_string(),
        Value::Bool(v) => v.to_string(),
    };
    println!("{rendered} [{}] ({label})", value.type_name());
}

fn exit_code(err: &ClientError) -> i32 {
    match err {
        ClientError::Status(code) => code.as_i32(),
        ClientError::Timeout => 3,
        ClientError::Closed => 3,
        _ => 2,
    }
}

fn key_from_args(layer: &str, group: &str, name: Option<&str>) -> Result<Key> {
    Key::new(Some(layer.to_string()), group.to_string(), name.map(str::to_string))
        .map_err(|e| anyhow::anyhow!(e.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args: Vec<String> = std::env::args().skip(1).collect();

    let mut socket_path = std::env::var("BUXTON_SOCKET_PATH").unwrap_or_else(|_| BUXTON_SOCKET.to_string());
    if let Some(pos) = args.iter().position(|a| a == "--socket") {
        args.remove(pos);
        if pos >= args.len() {
            bail!("--socket requires a value");
        }
        socket_path = args.remove(pos);
    }

    let mut layer_dir: Option<String> = None;
    if let Some(pos) = args.iter().position(|a| a == "--layer-dir") {
        args.remove(pos);
        if pos >= args.len() {
            bail!("--layer-dir requires a value");
        }
        layer_dir = Some(args.remove(pos));
    }

    let direct = if let Some(pos) = args.iter().position(|a| a == "--direct") {
        args.remove(pos);
        true
    } else {
        false
    };

    if args.is_empty() || args[0] == "help" || args[0] == "--help" || args[0] == "-h" {
        print_usage();
        return Ok(());
    }

    let ctl = if direct {
        if unsafe { libc::geteuid() } != 0 {
            eprintln!("error: --direct requires root");
            std::process::exit(exit_code(&ClientError::Status(StatusCode::EPerm)));
        }
        match DirectCtl::open(layer_dir.as_deref()) {
            Ok(d) => Ctl::Direct(d),
            Err(e) => {
                eprintln!("error: {e}");
                std::process::exit(2);
            }
        }
    } else {
        match BuxtonClient::open(&socket_path).await {
            Ok(c) => Ctl::Socket(c),
            Err(e) => {
                eprintln!("failed to connect to {socket_path}: {e}");
                std::process::exit(3);
            }
        }
    };

    let refs: Vec<&str> = args.iter().map(String::as_str).collect();
    let result = run(&ctl, &refs).await;

    match result {
        Ok(()) => Ok(()),
        Err(e) => {
            if let Some(client_err) = e.downcast_ref::<ClientError>() {
                eprintln!("error: {client_err}");
                std::process::exit(exit_code(client_err));
            }
            eprintln!("error: {e}");
            std::process::exit(2);
        }
    }
}

async fn run(client: &Ctl, args: &[&str]) -> Result<()> {
    match args {
        [cmd, layer, group, name, value] if cmd.starts_with("set-") => {
            let type_name = &cmd["set-".len()..];
            let key = key_from_args(layer, group, Some(*name))?;
            client.set(&key, parse_value(type_name, value)?).await?;
            println!("OK");
        }
        [cmd, layer, group, value] if cmd.starts_with("set-") => {
            let type_name = &cmd["set-".len()..];
            let key = key_from_args(layer, group, None)?;
            client.set(&key, parse_value(type_name, value)?).await?;
            println!("OK");
        }
        [cmd, layer, group, name] if cmd.starts_with("get-") && *cmd != "get-label" => {
            let key = key_from_args(layer, group, Some(*name))?;
            let (value, label) = client.get(&key).await?;
            print_value(&value, &label);
        }
        [cmd, layer, group] if cmd.starts_with("get-") && *cmd != "get-label" => {
            let key = key_from_args(layer, group, None)?;
            let (value, label) = client.get(&key).await?;
            print_value(&value, &label);
        }
        ["get-label", layer, group, name] => {
            let key = key_from_args(layer, group, Some(*name))?;
            let (_, label) = client.get(&key).await?;
            println!("{label}");
        }
        ["get-label", layer, group] => {
            let key = key_from_args(layer, group, None)?;
            let (_, label) = client.get(&key).await?;
            println!("{label}");
        }
        ["set-label", layer, group, name, label] => {
            let key = key_from_args(layer, group, Some(*name))?;
            client.set_label(&key, &Label::new(*label)?).await?;
            println!("OK");
        }
        ["set-label", layer, group, label] => {
            let key = key_from_args(layer, group, None)?;
            client.set_label(&key, &Label::new(*label)?).await?;
            println!("OK");
        }
        ["unset-value", layer, group, name] => {
            let key = key_from_args(layer, group, Some(*name))?;
            client.unset(&key).await?;
            println!("OK");
        }
        ["unset-value", layer, group] => {
            let key = key_from_args(layer, group, None)?;
            client.unset(&key).await?;
            println!("OK");
        }
        ["create-group", layer, group] => {
            let key = key_from_args(layer, group, None)?;
            client.create_group(&key).await?;
            println!("OK");
        }
        ["remove-group", layer, group] => {
            let key = key_from_args(layer, group, None)?;
            client.remove_group(&key).await?;
            println!("OK");
        }
        ["list-keys", layer] => {
            for key in client.list(layer).await? {
                println!("{key}");
            }
        }
        other => {
            eprintln!("unknown command: {}", other.join(" "));
            print_usage();
            std::process::exit(2);
        }
    }
    Ok(())
}
