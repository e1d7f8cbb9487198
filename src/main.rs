use std::collections::BTreeMap;
use std::fmt;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand, ValueEnum};
use crossbeam::channel::{self, Receiver, Sender};

use txcache::{
    CacheConfig, IsolationLevel, Transaction, TransactionConcurrency, TransactionError,
    TransactionManager,
};

const KEYS: [i32; 3] = [0, 1, 2];
const INITIAL_VALUE: &str = "INITIAL_VALUE";

#[derive(Parser)]
#[command(author, version, about = "Runs two concurrent transactions against a transactional cache")]
struct Cli {
    /// How long the first transaction sleeps after each operation (ms)
    #[arg(short, long, default_value_t = 500)]
    sleep_ms: u64,

    /// Lock wait timeout (ms); waits indefinitely when not set
    #[arg(short, long)]
    lock_timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single scenario
    Run {
        #[arg(long, value_enum, default_value_t = Operation::Put)]
        tx1_op: Operation,

        #[arg(long, value_enum, default_value_t = Isolation::ReadCommitted)]
        tx1_isolation: Isolation,

        #[arg(long, value_enum, default_value_t = Operation::Put)]
        tx2_op: Operation,

        #[arg(long, value_enum, default_value_t = Isolation::ReadCommitted)]
        tx2_isolation: Isolation,
    },

    /// Run every operation/isolation combination
    Matrix,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Operation {
    Get,
    Put,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Get => write!(f, "GET"),
            Operation::Put => write!(f, "PUT"),
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Isolation {
    ReadCommitted,
    RepeatableRead,
}

impl From<Isolation> for IsolationLevel {
    fn from(isolation: Isolation) -> Self {
        match isolation {
            Isolation::ReadCommitted => IsolationLevel::ReadCommitted,
            Isolation::RepeatableRead => IsolationLevel::RepeatableRead,
        }
    }
}

#[derive(Clone, Copy)]
struct TxParams {
    op: Operation,
    isolation: Isolation,
}

/// The first transaction opens the latch after touching key 0; the second
/// waits on it before starting.
enum Latch {
    Release(Sender<()>),
    Await(Receiver<()>),
}

struct Scenario {
    sleep: Duration,
    lock_timeout: Option<Duration>,
}

impl Scenario {
    fn run(&self, tx1: TxParams, tx2: TxParams) -> Result<BTreeMap<i32, String>> {
        println!(
            "=== TX1 [{},{},{}], TX2 [{},{},{}] ===",
            tx1.op,
            TransactionConcurrency::Pessimistic,
            IsolationLevel::from(tx1.isolation),
            tx2.op,
            TransactionConcurrency::Pessimistic,
            IsolationLevel::from(tx2.isolation),
        );

        let mut config = CacheConfig::default();
        if let Some(timeout) = self.lock_timeout {
            config = config.with_lock_wait_timeout(timeout);
        }

        let tm: TransactionManager<i32, String> = TransactionManager::new(config);
        for key in KEYS {
            tm.put_initial(key, INITIAL_VALUE.to_string())
                .with_context(|| format!("failed to seed key {}", key))?;
        }

        let (latch_tx, latch_rx) = channel::bounded(1);
        crossbeam::thread::scope(|s| {
            let tm = &tm;
            let first = s.spawn(move |_| self.run_tx(tm, "TX-1", tx1, Latch::Release(latch_tx)));
            let second = s.spawn(move |_| self.run_tx(tm, "TX-2", tx2, Latch::Await(latch_rx)));

            for handle in [first, second] {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => println!("{}", e),
                    Err(_) => println!("transaction thread panicked"),
                }
            }
        })
        .map_err(|_| anyhow!("scenario threads panicked"))?;

        let results: BTreeMap<i32, String> = tm.get_all(&KEYS).into_iter().collect();
        println!(">>>>>> Results: {:?}", results);
        Ok(results)
    }

    fn run_tx(
        &self,
        tm: &TransactionManager<i32, String>,
        name: &str,
        params: TxParams,
        latch: Latch,
    ) -> std::result::Result<(), TransactionError> {
        let mut txn = tm.begin(TransactionConcurrency::Pessimistic, params.isolation.into());
        println!(
            "[{},{},{},{}] Started",
            name,
            txn.concurrency(),
            txn.isolation_level(),
            params.op
        );

        match self.execute(tm, &mut txn, name, params.op, latch) {
            Ok(()) => {
                println!("{} Before commit", name);
                tm.commit(&mut txn)?;
                println!("{} After commit", name);
                Ok(())
            }
            Err(e) => {
                println!("{} Failed: {}", name, e);
                if txn.is_active() {
                    tm.rollback(&mut txn)?;
                }
                Err(e)
            }
        }
    }

    fn execute(
        &self,
        tm: &TransactionManager<i32, String>,
        txn: &mut Transaction<i32, String>,
        name: &str,
        op: Operation,
        latch: Latch,
    ) -> std::result::Result<(), TransactionError> {
        let start = match latch {
            Latch::Release(open) => {
                self.apply(tm, txn, name, op, KEYS[0], true)?;
                // The receiver may already be gone if the other side failed
                let _ = open.send(());
                1
            }
            Latch::Await(opened) => {
                println!("{} Waiting for first tx", name);
                // A disconnected latch means the first transaction gave up
                let _ = opened.recv();
                0
            }
        };

        let sleep = start == 1;
        for &key in &KEYS[start..] {
            self.apply(tm, txn, name, op, key, sleep)?;
        }
        Ok(())
    }

    fn apply(
        &self,
        tm: &TransactionManager<i32, String>,
        txn: &mut Transaction<i32, String>,
        name: &str,
        op: Operation,
        key: i32,
        sleep: bool,
    ) -> std::result::Result<(), TransactionError> {
        match op {
            Operation::Get => {
                let value = tm.get(txn, &key)?;
                println!("{} Got: [key={}, value={:?}]", name, key, value);
            }
            Operation::Put => {
                tm.put(txn, key, name.to_string())?;
                println!("{} Put: [key={}, value={}]", name, key, name);
            }
        }

        if sleep {
            thread::sleep(self.sleep);
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let scenario = Scenario {
        sleep: Duration::from_millis(cli.sleep_ms),
        lock_timeout: cli.lock_timeout_ms.map(Duration::from_millis),
    };

    match cli.command {
        Commands::Run {
            tx1_op,
            tx1_isolation,
            tx2_op,
            tx2_isolation,
        } => {
            scenario.run(
                TxParams { op: tx1_op, isolation: tx1_isolation },
                TxParams { op: tx2_op, isolation: tx2_isolation },
            )?;
        }
        Commands::Matrix => {
            let isolations = [
                (Isolation::ReadCommitted, Isolation::ReadCommitted),
                (Isolation::RepeatableRead, Isolation::RepeatableRead),
                (Isolation::RepeatableRead, Isolation::ReadCommitted),
                (Isolation::ReadCommitted, Isolation::RepeatableRead),
            ];
            let operations = [
                (Operation::Get, Operation::Get),
                (Operation::Get, Operation::Put),
                (Operation::Put, Operation::Get),
                (Operation::Put, Operation::Put),
            ];

            for (iso1, iso2) in isolations {
                for (op1, op2) in operations {
                    scenario.run(
                        TxParams { op: op1, isolation: iso1 },
                        TxParams { op: op2, isolation: iso2 },
                    )?;
                }
            }
        }
    }

    Ok(())
}
