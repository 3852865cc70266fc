use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{debug, info};
use mealplan::core::{Format, Week};
use mealplan::layout::open_layout;
use mealplan::settings::{IgnoreList, Settings, load_settings};
use mealplan::storage::{DocumentStore, FsDocumentStore};
use mealplan::week::week_start_label;
use mealplan::{MealPlanner, convert, detect_format};

#[derive(Debug, Parser)]
#[command(
    name = "mealplan",
    about = "Edit weekly meal plans kept as Markdown notes",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// Settings file to load instead of ./mealplan.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the week label for a date.
    Week(WeekArgs),

    /// Print the layout of a note: list, table or none.
    Detect(DetectArgs),

    /// Add a recipe to the meal plan.
    Add(AddArgs),

    /// Remove a recipe from the meal plan.
    Remove(RemoveArgs),

    /// Rewrite a meal plan in the other layout.
    Convert(ConvertArgs),

    /// Print the weeks of a meal plan.
    Show(ShowArgs),

    /// List recipe names found in the recipe folder.
    Recipes(RecipesArgs),
}

#[derive(Debug, Args)]
struct WeekArgs {
    /// Date to label (YYYY-MM-DD). Defaults to today.
    #[arg(long)]
    date: Option<NaiveDate>,
}

#[derive(Debug, Args)]
struct DetectArgs {
    file: PathBuf,
}

#[derive(Debug, Args)]
struct AddArgs {
    /// Recipe name, without the surrounding brackets.
    #[arg(long)]
    recipe: String,
    /// Day of the week to plan it on ("Monday", "mon", ...).
    #[arg(long)]
    day: String,
    /// Any date in the target week (YYYY-MM-DD). Defaults to the current week.
    #[arg(long)]
    date: Option<NaiveDate>,
    /// Meal plan note to edit instead of the configured one.
    #[arg(long)]
    note: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct RemoveArgs {
    #[arg(long)]
    recipe: String,
    /// The date the recipe is planned on (YYYY-MM-DD).
    #[arg(long)]
    date: NaiveDate,
    /// Meal plan note to edit instead of the configured one.
    #[arg(long)]
    note: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ConvertArgs {
    /// Target layout.
    #[arg(long, value_enum)]
    to: LayoutArg,
    /// Overwrite the note instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
    /// Note to convert. Defaults to the configured meal plan.
    file: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ShowArgs {
    /// Emit JSON instead of a human-readable outline.
    #[arg(long)]
    json: bool,
    /// Note to read. Defaults to the configured meal plan.
    file: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct RecipesArgs {
    /// Folder to scan. Defaults to the configured recipe folder.
    dir: Option<PathBuf>,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum LayoutArg {
    List,
    Table,
}

impl From<LayoutArg> for Format {
    fn from(arg: LayoutArg) -> Self {
        match arg {
            LayoutArg::List => Format::List,
            LayoutArg::Table => Format::Table,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let settings = load_settings(cli.config.as_deref()).context("loading settings")?;
    debug!("settings: {settings:?}");
    match cli.command {
        Commands::Week(args) => handle_week(args, &settings),
        Commands::Detect(args) => handle_detect(args),
        Commands::Add(args) => handle_add(args, settings),
        Commands::Remove(args) => handle_remove(args, settings),
        Commands::Convert(args) => handle_convert(args, &settings),
        Commands::Show(args) => handle_show(args, &settings),
        Commands::Recipes(args) => handle_recipes(args, &settings),
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

fn handle_week(args: WeekArgs, settings: &Settings) -> Result<()> {
    let date = args.date.unwrap_or_else(|| Local::now().date_naive());
    let start_of_week = settings.start_of_week()?;
    println!("{}", week_start_label(date, start_of_week));
    Ok(())
}

fn handle_detect(args: DetectArgs) -> Result<()> {
    let text =
        fs::read_to_string(&args.file).with_context(|| format!("reading {:?}", args.file))?;
    match detect_format(&text) {
        Some(format) => println!("{format}"),
        None => println!("none"),
    }
    Ok(())
}

fn handle_add(args: AddArgs, settings: Settings) -> Result<()> {
    let AddArgs {
        recipe,
        day,
        date,
        note,
    } = args;
    let planner = MealPlanner::new(note_settings(settings, note), FsDocumentStore);
    match date {
        Some(date) => planner.add_recipe_to_meal_plan_by_date(&recipe, date, &day)?,
        None => planner.add_recipe_to_meal_plan(&recipe, &day)?,
    }
    info!("added {recipe:?} to {:?}", planner.meal_plan_path());
    Ok(())
}

fn handle_remove(args: RemoveArgs, settings: Settings) -> Result<()> {
    let RemoveArgs { recipe, date, note } = args;
    let planner = MealPlanner::new(note_settings(settings, note), FsDocumentStore);
    planner.remove_recipe_from_meal_plan(&recipe, date)?;
    Ok(())
}

fn handle_convert(args: ConvertArgs, settings: &Settings) -> Result<()> {
    let ConvertArgs { to, in_place, file } = args;
    let path = file.unwrap_or_else(|| settings.meal_plan_path());
    let headers = settings.day_headers()?;
    let target = Format::from(to);
    let store = FsDocumentStore;

    if in_place {
        return store
            .modify_document(&path, &mut |text: &str| -> Result<String> {
                Ok(convert(text, target, &headers))
            })
            .with_context(|| format!("converting {:?}", path));
    }
    let text = store
        .read_document(&path)?
        .with_context(|| format!("{:?} does not exist", path))?;
    let converted = convert(&text, target, &headers);
    print!("{converted}");
    if !converted.ends_with('\n') {
        println!();
    }
    Ok(())
}

fn handle_show(args: ShowArgs, settings: &Settings) -> Result<()> {
    let ShowArgs { json, file } = args;
    let path = file.unwrap_or_else(|| settings.meal_plan_path());
    let headers = settings.day_headers()?;
    let weeks = FsDocumentStore
        .read_document(&path)?
        .and_then(|text| open_layout(&text, &headers).map(|layout| layout.weeks()))
        .unwrap_or_default();

    if json {
        println!("{}", serde_json::to_string_pretty(&weeks)?);
        return Ok(());
    }
    if weeks.is_empty() {
        eprintln!("No meal plan found in {:?}.", path);
        return Ok(());
    }
    print!("{}", outline(&weeks));
    Ok(())
}

fn handle_recipes(args: RecipesArgs, settings: &Settings) -> Result<()> {
    let dir = args.dir.unwrap_or_else(|| settings.recipe_path());
    let ignore = settings.ignore_list()?;
    for name in collect_recipe_names(&dir, &ignore)? {
        println!("{name}");
    }
    Ok(())
}

/// Points the settings at `note` when one is given on the command line.
fn note_settings(settings: Settings, note: Option<PathBuf>) -> Settings {
    match note {
        Some(note) => Settings {
            vault_root: PathBuf::new(),
            meal_plan_note: note.to_string_lossy().into_owned(),
            ..settings
        },
        None => settings,
    }
}

fn outline(weeks: &[Week]) -> String {
    let mut out = String::new();
    for week in weeks {
        out.push_str(&format!("Week of {}\n", week.label));
        for (day, entries) in &week.days {
            if entries.is_empty() {
                continue;
            }
            let names: Vec<String> = entries
                .iter()
                .map(|entry| match entry.recipe_name() {
                    Some(name) => name.to_string(),
                    None => entry.render_cell(),
                })
                .collect();
            out.push_str(&format!("  {:<10} {}\n", day, names.join(", ")));
        }
    }
    out
}

/// Recipe names (Markdown file stems) under `dir`, sorted, skipping ignored paths.
/// Ignore patterns match the path relative to `dir`, with `/` separators.
fn collect_recipe_names(dir: &Path, ignore: &IgnoreList) -> Result<Vec<String>> {
    let root = fs::canonicalize(dir).with_context(|| format!("resolving path {:?}", dir))?;
    let mut out = Vec::new();
    let mut visited = HashSet::new();
    visit_dir(&root, &root, ignore, &mut out, &mut visited)?;
    out.sort();
    out.dedup();
    Ok(out)
}

fn visit_dir(
    root: &Path,
    path: &Path,
    ignore: &IgnoreList,
    out: &mut Vec<String>,
    visited: &mut HashSet<PathBuf>,
) -> Result<()> {
    let canonical = fs::canonicalize(path)?;
    if !visited.insert(canonical.clone()) {
        return Ok(());
    }

    let relative = canonical
        .strip_prefix(root)
        .unwrap_or(&canonical)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    if !relative.is_empty() && ignore.is_ignored(&relative) {
        debug!("ignoring {relative}");
        return Ok(());
    }

    let metadata = fs::metadata(&canonical)?;
    if metadata.is_dir() {
        for entry in fs::read_dir(&canonical)? {
            let entry = entry?;
            if entry.file_type()?.is_symlink() {
                continue;
            }
            visit_dir(root, &entry.path(), ignore, out, visited)?;
        }
    } else if metadata.is_file()
        && canonical
            .extension()
            .map(|ext| ext == "md")
            .unwrap_or(false)
    {
        if let Some(stem) = canonical.file_stem() {
            out.push(stem.to_string_lossy().into_owned());
        }
    }
    Ok(())
}
