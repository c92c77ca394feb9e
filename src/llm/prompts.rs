//! Message texts sent to the model.

use crate::testing::CrashReport;

pub const SYSTEM_MESSAGE: &str =
    "You are a competent and diligent python programmer. You write python code.";

pub const FORMATTING_CORRECTION: &str =
    "Your response should start with ```python and end with ```. Try again.";

/// The opening request: complete `incomplete_file` so it does what `goal` describes.
pub fn generation_prompt(incomplete_file: &str, custom_types_json: &str, goal: &str) -> String {
    format!(
        r#"
The following message contains an incomplete python file.

The file has imports and an incomplete function. Your task is to return the completed version of the file.

Here is the incomplete python file:
```python
{incomplete_file}
```


Pay specific attention to the incomplete function—it should accomplish the following:
```
{goal}
```


When available, use the incomplete function's name, parameter names, parameter types, and return type to further understand its intent.

You have an entire python interpreter at your disposal. In the completed file, import modules and define helper functions as needed. Be sure to use the incomplete function's exact signature in your completed file.

Here is a json object that contains metadata about custom python types that are relevant to the file. All of these types are already defined and they're available to your file via import. Do not redefine them. Use them as needed to complete the file:
```
{custom_types_json}
```


For installed types, use the qualname and module to recall your existing knowledge of their variables and methods. For local types, use the type hints and source code provided to understand how they could be used.

Extremely common types, such as those from python's builtin module or the typing module, are intentionally excluded from the object above. Use your existing knowledge of these types to understand them, then import them and use them as needed.

In your code, provide type hints that an experienced programmer would find helpful. Use docstrings and comments when helpful. If you would like to raise an exception, wrap it in InferredException.

Respond with only the completed version of the python file, delimited by triple-backticks and using a python identifier. Additional information will be ignored.

Example incomplete file:
```python
from typing import List

def get_even_numbers(numbers: List[int]) -> List[int]:
```


Example response:
```python
from typing import List

def get_even_numbers(numbers: List[int]) -> List[int]:
    return [number for number in numbers if number % 2 == 0]
```
"#
    )
}

/// `exception` is the rendered exception (or load failure) raised by the previous version.
pub fn execution_correction(exception: &str) -> String {
    format!(
        "The previous code did not execute. It returned the following exception:\n```\n{}\n```\n\n\
         Use the same information in my original message to complete the original task. \
         When correcting your response, be sure to think about the root cause of the exception and adjust for it. \
         Remember, if you want to raise an exception, wrap it in InferredException.",
        exception
    )
}

pub fn test_correction(test_source: &str, crash: &CrashReport) -> String {
    format!(
        "The following tests were executed: \n```\n{}\n```\n\n\
         The tests failed with message:\n```\n{}\n```\n\n\
         Use the test's source code to further understand the intended design of the incomplete function, \
         and reference the information in my original message to try again to complete the original task. \
         Be sure to think about the root cause of the test failure and adjust your response to better align \
         with the intent of the incomplete function.",
        test_source, crash.message
    )
}
