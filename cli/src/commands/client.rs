use std::time::Duration;

use anyhow::Context;
use serde_json::json;

use nsbroker::{AsyncHandle, Connection, ReadOutcome, Wait};

use crate::cli::{
    ConnectArgs, EvalArgs, ExecArgs, KillArgs, LsArgs, NamespaceArgs, PollArgs, ReadArgs,
    SubmitArgs,
};
use crate::error::CliResult;

async fn connect(args: &ConnectArgs) -> CliResult<Connection> {
    Connection::connect_with(
        &args.hostspec,
        args.password.as_deref(),
        args.namespace.as_deref(),
    )
    .await
    .with_context(|| format!("failed to connect to {}", args.hostspec))
}

fn print(value: serde_json::Value) {
    println!("{value}");
}

pub async fn exec(args: ExecArgs) -> CliResult<()> {
    let conn = connect(&args.connect).await?;
    conn.exec(&args.code).await?;
    Ok(())
}

pub async fn eval(args: EvalArgs) -> CliResult<()> {
    let conn = connect(&args.connect).await?;
    let value = if args.unlocked {
        conn.eval_unlocked_in(conn.namespace(), &args.expr).await?
    } else {
        conn.eval(&args.expr).await?
    };
    print(value.to_json());
    Ok(())
}

pub async fn submit(args: SubmitArgs) -> CliResult<()> {
    let conn = connect(&args.connect).await?;
    let handle = conn
        .submit_in(conn.namespace(), &args.code, args.expr.as_deref())
        .await?;
    print(json!({ "namespace": handle.namespace, "id": handle.id }));
    Ok(())
}

pub async fn read(args: ReadArgs) -> CliResult<()> {
    let conn = connect(&args.connect).await?;
    let wait = match (args.wait, args.timeout) {
        (true, _) => Wait::Forever,
        (false, Some(secs)) => Wait::Timeout(
            Duration::try_from_secs_f64(secs).context("invalid --timeout")?,
        ),
        (false, None) => Wait::Immediate,
    };
    let handle = AsyncHandle::new(conn.namespace(), args.id);
    match conn.read_async(&handle, wait).await? {
        ReadOutcome::Ready(value) => print(value.to_json()),
        ReadOutcome::Busy => print(json!({ "busy": true })),
    }
    Ok(())
}

pub async fn poll(args: PollArgs) -> CliResult<()> {
    let conn = connect(&args.connect).await?;
    print(json!(conn.poll_async(None).await?));
    Ok(())
}

pub async fn ls(args: LsArgs) -> CliResult<()> {
    let conn = connect(&args.connect).await?;
    if args.origins {
        print(json!(conn.ls_remote_origins().await?));
    } else if args.remote {
        print(json!(conn.ls_remote().await?));
    } else {
        print(json!(conn.ls_local().await?));
    }
    Ok(())
}

pub async fn drop(args: NamespaceArgs) -> CliResult<()> {
    let conn = connect(&args.connect).await?;
    conn.drop_ns(&args.target).await?;
    Ok(())
}

pub async fn unlock(args: NamespaceArgs) -> CliResult<()> {
    let conn = connect(&args.connect).await?;
    let (status, message) = conn.unlock_ns(&args.target).await?;
    print(json!({ "status": status, "message": message }));
    Ok(())
}

pub async fn kill(args: KillArgs) -> CliResult<()> {
    let conn = connect(&args.connect).await?;
    conn.kill_server().await?;
    Ok(())
}
