//! Instruction texts submitted to the job runner and the code-generation
//! prompts for the synchronous phases. The entry-point names are fixed: the
//! drivers generated for routine execution invoke them verbatim.

pub const QUERY_ENTRY_POINT: &str = "generate_query";
pub const GRAPH_ENTRY_POINT: &str = "generate_method";

/// How many question/solution pairs query generation must produce.
pub const QUERY_COUNT: usize = 10;

/// Lines of the cleaned CSV captured as the header snapshot: the column row
/// plus a handful of sample rows.
pub const CSV_PREVIEW_LINES: usize = 6;

/// Cleaning instruction for the job runner. The uploaded spreadsheet is
/// converted to a canonical CSV with inferred, normalized column names.
pub const CLEAN_INSTRUCTION: &str = r#"You are given an xlsx file, or a file in some other
tabular format. Convert it to a .csv file suitable for data analytics.

Examine the first few rows to infer the proper column names. The first line
is often not the column names; sometimes the second or third line contains
them. Keep column names mostly as they were. When a column header is empty
but the values below clearly follow a pattern, name the column accordingly
(for example "No" or "Date").

Split combined columns into separate ones. Examples:
- column "HB" with value "HB: 35" becomes column "HB" with value "35"
- column "HB / HCT" with value "HB: 35, HCT: 20" becomes column "HB" with
  value "35" and column "HCT" with value "20"
- column "BMI (early/ pre-pregnancy)" with value "40.1 / 46.6" becomes
  column "BMI: early" with value "40.1" and column "BMI: pre-pregnancy"
  with value "46.6"

Ensure each column's data type matches its inferred name. Translate all
words to English; every character in the output should be English. Remove
stray decoration according to the meaning of the word.

Standardize the data: all values consistent and correctly matched, and all
rows converted. When writing the CSV, preserve quoting by using
quotechar='"' together with quoting=csv.QUOTE_NONNUMERIC."#;

/// Insights instruction for the job runner: two complex questions, each
/// rendered and saved as an image.
pub const INSIGHTS_INSTRUCTION: &str = r#"I am building a data analytics platform with advanced
charts and graphs. To draw them:
- first, formulate 2 complex questions with solutions;
- then draw insights based on those questions and save each one as an image."#;

/// Prompt for the routine that invents the analysis question list.
pub fn query_generation_prompt(head: &str) -> String {
    format!(
        r#"Develop a Python method named `{QUERY_ENTRY_POINT}` that returns query_data.

I have a dataset; an example of it looks like:
```
{head}
```
I am building a data analytics platform with advanced charts and graphs.
To draw them I need some complex questions with solutions.

Return an array value containing {QUERY_COUNT} questions. Example data looks like:
```
query_data = [
    {{
        "question": "Draw a bar chart comparing the total number of items sold for the top 5 products by revenue.",
        "solution": "The steps to implement the question above, not code."
    }}
]
```"#
    )
}

/// Prompt for the routine that renders one query's chart. The routine saves
/// the image into its working directory and returns just the filename.
pub fn graph_prompt(
    header: &str,
    question: &str,
    solution: &str,
    record_id: &str,
    index: usize,
) -> String {
    format!(
        r#"Develop a Python method named `{GRAPH_ENTRY_POINT}` which accepts only a DataFrame as input. The method works through these steps:

1. Make a copy of the input DataFrame.
2. Analyze the head of the DataFrame to understand its structure and content.
3. Extract all column names - ```{header}```.
4. ```{question}```
   Solution: ```{solution}```
5. Use the `seaborn` library to generate the chart and datetime to process date and time values.
6. Set the figure size to (12, 6), then save the chart as ```{record_id}_{index}.png``` in the current working directory. Return just that filename, not a path.
7. Ensure the chart includes a clear and intuitive title, as well as labeled axes.
8. Apply a visually appealing color scheme and a unique chart style.

Please implement this method with the specifications above."#
    )
}
