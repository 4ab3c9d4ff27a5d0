//! MTOMO 지연 실험
//!
//! 수신자 종단 지연만으로 링크별 지연 분포를 추정
//!
//! 사용법:
//!   cargo run --release --bin mtomo-delay -- [OPTIONS]

use std::path::PathBuf;

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use mtomo::experiment::{LinkEstimate, TrialOutcome};
use mtomo::{run_delay_experiment, Config, DelayKind, LinkConfig};

struct DelayArgs {
    config: Config,
    save_path: Option<PathBuf>,
    verbose: bool,
}

fn parse_args() -> DelayArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::delay();
    let mut kind = DelayKind::Uniform;
    let mut mean = 1.0;
    let mut save_path = None;
    let mut verbose = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--depth" | "-d" => {
                if i + 1 < args.len() {
                    config.depth = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--delay-type" | "-t" => {
                if i + 1 < args.len() {
                    kind = args[i + 1].parse().expect("geometric, pareto 또는 uniform");
                    i += 1;
                }
            }
            "--mean" | "-m" => {
                if i + 1 < args.len() {
                    mean = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--bin-width" | "-q" => {
                if i + 1 < args.len() {
                    config.bin_width = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--probes" | "-n" => {
                if i + 1 < args.len() {
                    config.num_probes = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--trials" => {
                if i + 1 < args.len() {
                    config.num_trials = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--seed" => {
                if i + 1 < args.len() {
                    config.base_seed = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--workers" | "-w" => {
                if i + 1 < args.len() {
                    config.parallel_workers = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--save" | "-s" => {
                if i + 1 < args.len() {
                    save_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--verbose" | "-v" => {
                verbose = true;
            }
            "--help" | "-h" => {
                println!(
                    r#"MTOMO Delay - 멀티캐스트 지연 분포 토모그래피 실험

사용법:
  cargo run --release --bin mtomo-delay -- [OPTIONS]

옵션:
  -d, --depth <N>          이진 트리 깊이 (기본: 2)
  -t, --delay-type <TYPE>  geometric | pareto | uniform (기본: uniform)
  -m, --mean <MEAN>        링크 평균 지연 (기본: 1.0)
  -q, --bin-width <Q>      지연 bin 폭 (기본: 1.0)
  -n, --probes <N>         시행당 프로브 수 (기본: 10000)
  --trials <N>             시행 수 (기본: 5)
  --seed <N>               첫 시행 시드 (기본: 1)
  -w, --workers <N>        병렬 워커 수 (기본: CPU 코어 수)
  -s, --save <PATH>        bincode 리포트 저장 경로
  -v, --verbose            디버그 로그 출력
  -h, --help               이 도움말 출력
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    config.link = LinkConfig::Delay { kind, mean };
    DelayArgs {
        config,
        save_path,
        verbose,
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = parse_args();

    // 로깅 설정
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = &args.config;
    info!("MTOMO delay experiment starting...");
    info!("Depth: {}", config.depth);
    info!("Link: {:?}", config.link);
    info!("Bin width: {}", config.bin_width);
    info!("Probes: {} x {} trials", config.num_probes, config.num_trials);

    let report = run_delay_experiment(config)?;
    println!("{}", report.summary());

    // 첫 완료 시행의 노드별 추정 분포
    let first = report.trials.iter().find_map(|trial| match &trial.outcome {
        TrialOutcome::Completed { links, .. } => Some((trial.trial, links)),
        _ => None,
    });
    if let Some((trial, links)) = first {
        println!("inferred distributions (trial {}):", trial);
        for link in links {
            if let LinkEstimate::Delay {
                node,
                truth,
                inferred,
            } = link
            {
                println!("  node {}: alpha={:.4?} truth={:.4?}", node, inferred, truth);
            }
        }
    }

    if let Some(path) = &args.save_path {
        report.save(path)?;
        info!("Report saved: {:?}", path);
    }

    Ok(())
}
