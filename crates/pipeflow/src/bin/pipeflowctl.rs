use std::env;

use sqlx::{postgres::PgPoolOptions, PgPool};
use uuid::Uuid;

use pipeflow::jobs::{JobLedger, NewJob, Stage};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprintln!(
            "pipeflowctl <command>\n\
             Commands:\n\
             - reset\n\
             - seed <n>\n\
             - demo\n\
             - timeline <job_id>\n\
             - budget\n\
             \n\
             Uses DATABASE_URL or TEST_DATABASE_URL.\n"
        );
        std::process::exit(2);
    }

    let url = env::var("DATABASE_URL")
        .or_else(|_| env::var("TEST_DATABASE_URL"))
        .expect("DATABASE_URL or TEST_DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await?;

    match args[1].as_str() {
        "reset" => reset(&pool).await?,
        "seed" => {
            let n: i64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(10);
            seed(&pool, n).await?;
        }
        "demo" => {
            reset(&pool).await?;
            seed(&pool, 5).await?;
            show_counts(&pool).await?;
        }
        "timeline" => {
            let id = args.get(2).expect("usage: pipeflowctl timeline <job_id>");
            let job_id: Uuid = id.parse()?;
            print_timeline(&pool, job_id).await?;
        }
        "budget" => print_budget(&pool).await?,
        other => {
            eprintln!("Unknown command: {other}");
            std::process::exit(2);
        }
    }

    Ok(())
}

async fn reset(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        TRUNCATE TABLE
            dlq_entries,
            budget_entries,
            budget_days,
            job_transitions,
            jobs
        RESTART IDENTITY CASCADE
        "#,
    )
    .execute(pool)
    .await?;

    println!("reset OK");
    Ok(())
}

async fn seed(pool: &PgPool, n: i64) -> anyhow::Result<()> {
    let ledger = JobLedger::new(pool.clone());
    let run = Uuid::new_v4().simple().to_string();

    for i in 0..n {
        let entity = format!("seed-{}-{i}", &run[..8]);
        let job_id = ledger
            .create(NewJob::new(
                &entity,
                Stage::Discovery,
                serde_json::json!({ "channel_url": format!("https://example.com/{entity}") }),
            ))
            .await?;
        println!("seeded {entity} -> {job_id}");
    }

    Ok(())
}

async fn show_counts(pool: &PgPool) -> anyhow::Result<()> {
    let rows = sqlx::query_as::<_, (String, String, i64)>(
        r#"
        SELECT stage, status, COUNT(*)
        FROM jobs
        GROUP BY stage, status
        ORDER BY stage, status
        "#,
    )
    .fetch_all(pool)
    .await?;

    println!("--- jobs by stage/status ---");
    for (stage, status, count) in rows {
        println!("{stage:>15} {status:>12} {count:>6}");
    }
    Ok(())
}

async fn print_timeline(pool: &PgPool, job_id: Uuid) -> anyhow::Result<()> {
    let ledger = JobLedger::new(pool.clone());
    let job = ledger.get(job_id).await?;

    println!(
        "job {} entity={} stage={} status={} attempts={}/{}",
        job.id, job.source_entity_id, job.stage, job.status, job.attempt_count, job.max_attempts
    );

    for t in ledger.timeline(job_id).await? {
        let error = match (&t.error_kind, &t.error_message) {
            (Some(kind), Some(msg)) => format!(" [{kind}: {msg}]"),
            (Some(kind), None) => format!(" [{kind}]"),
            _ => String::new(),
        };
        println!(
            "  {} {} -> {}{}",
            t.recorded_at.to_rfc3339(),
            t.from_status,
            t.to_status,
            error
        );
    }
    Ok(())
}

async fn print_budget(pool: &PgPool) -> anyhow::Result<()> {
    let rows = sqlx::query_as::<_, (String, chrono::NaiveDate, f64, f64)>(
        r#"
        SELECT resource_class, day, committed_usd, reserved_usd
        FROM budget_days
        WHERE day = (now() AT TIME ZONE 'utc')::date
        ORDER BY resource_class
        "#,
    )
    .fetch_all(pool)
    .await?;

    if rows.is_empty() {
        println!("no spend recorded today");
        return Ok(());
    }

    println!("--- today's spend ---");
    for (class, day, committed, reserved) in rows {
        println!("{day} {class:>15} committed={committed:.2} reserved={reserved:.2}");
    }
    Ok(())
}
